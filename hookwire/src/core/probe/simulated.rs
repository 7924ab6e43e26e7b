//! # Simulated host
//!
//! Host registry not touching the system: hooks are a configured list and
//! a generator thread fires every registered program at a fixed rate,
//! publishing synthetic records.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use events::{EventRecord, ProbeKind, XdpAction, SCHEMA_XDP};
use log::{debug, error};

use super::{HookRegistry, ProgramHandle};
use crate::{
    core::events::Publisher,
    helpers::{signals::Running, time::monotonic_timestamp},
};

pub(crate) struct SimulatedRegistry {
    hooks: HashSet<String>,
    /// Probe ids the host refuses to register.
    rejected: HashSet<String>,
    period: Duration,
    programs: Arc<Mutex<Vec<ProgramHandle>>>,
    run_state: Option<Running>,
    generator: Option<JoinHandle<()>>,
}

/// Highest generation rate, giving a 1us period.
const MAX_RATE_HZ: u32 = 1_000_000;

impl SimulatedRegistry {
    pub(crate) fn new(hooks: &[String], rate_hz: u32, rejected: &[String]) -> Result<Self> {
        if rate_hz == 0 || rate_hz > MAX_RATE_HZ {
            bail!("Simulated event rate must be between 1 and {MAX_RATE_HZ} Hz");
        }

        Ok(SimulatedRegistry {
            hooks: hooks.iter().cloned().collect(),
            rejected: rejected.iter().cloned().collect(),
            period: Duration::from_secs(1) / rate_hz,
            programs: Arc::new(Mutex::new(Vec::new())),
            run_state: None,
            generator: None,
        })
    }
}

/// Build the payload a real probe would report, following its schema.
fn payload(program: &ProgramHandle, seq: u32) -> Vec<u8> {
    if program.descriptor.schema_version() != SCHEMA_XDP {
        return Vec::new();
    }

    let mut fields = vec![1, seq % 4, 64 + seq % 1436];
    if program.descriptor.kind() == ProbeKind::Exit {
        fields.push(XdpAction::Pass as u32);
    }
    fields.iter().flat_map(|f| f.to_ne_bytes()).collect()
}

fn generate(
    programs: Arc<Mutex<Vec<ProgramHandle>>>,
    mut publisher: Publisher,
    period: Duration,
    run_state: Running,
) {
    let mut seq: u32 = 0;

    while run_state.sleep(period) {
        let programs = programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for program in programs.iter() {
            let ts = match monotonic_timestamp() {
                Ok(ts) => ts,
                Err(e) => {
                    error!("Could not get timestamp: {e}");
                    return;
                }
            };

            match EventRecord::new(ts, program.hook_id, &payload(program, seq)) {
                Ok(record) => {
                    // Lost events are accounted by the channel.
                    publisher.publish(&record);
                }
                Err(e) => error!("Could not build record: {e}"),
            }
        }

        seq = seq.wrapping_add(1);
    }
}

impl HookRegistry for SimulatedRegistry {
    fn recognizes(&self, hook: &str, _: ProbeKind) -> bool {
        self.hooks.contains(hook)
    }

    fn traces_programs(&self) -> bool {
        true
    }

    fn register(&mut self, hook: &str, kind: ProbeKind, program: &ProgramHandle) -> Result<()> {
        if self.rejected.contains(program.descriptor.id()) {
            bail!("program refused by the simulated host");
        }

        debug!(
            "Simulating {kind} program on {hook} (hook id {})",
            program.hook_id
        );
        self.programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(program.clone());
        Ok(())
    }

    fn unregister(&mut self, program: &ProgramHandle) -> Result<()> {
        let mut programs = self
            .programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match programs.iter().position(|p| p.hook_id == program.hook_id) {
            Some(pos) => {
                programs.remove(pos);
                Ok(())
            }
            None => bail!("program {} is not registered", program.hook_id),
        }
    }

    fn start_events(&mut self, publisher: Publisher) -> Result<()> {
        if self.generator.is_some() {
            bail!("Events already started");
        }

        let run_state = Running::ignore_signals();
        let programs = Arc::clone(&self.programs);
        let period = self.period;
        let rs = run_state.clone();

        self.generator = Some(
            thread::Builder::new()
                .name("hookwire-simulated".to_string())
                .spawn(move || generate(programs, publisher, period, rs))?,
        );
        self.run_state = Some(run_state);
        Ok(())
    }

    fn stop_events(&mut self) -> Result<()> {
        if let Some(run_state) = self.run_state.take() {
            run_state.terminate();
        }

        self.generator.take().map_or(Ok(()), |th| {
            th.join()
                .map_err(|_| anyhow!("while joining the event generator thread"))
        })
    }
}

impl Drop for SimulatedRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.stop_events() {
            error!("{e}");
        }
    }
}
