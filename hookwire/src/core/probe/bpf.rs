//! # BPF host
//!
//! Host registry loading the program artifacts as BPF objects using
//! libbpf-rs. The program named like the probe id is attached as an XDP
//! program on the `hook` interface (standalone probes) or as a fentry/fexit
//! program on the `hook` kernel function (entry/exit probes). Entry/exit
//! probes can also trace an attached standalone program, using its fd as the
//! attach target. Each object reports its events through its own `events`
//! ring buffer map.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    os::fd::{AsFd, AsRawFd},
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use events::{EventRecord, ProbeKind};
use log::{debug, error, warn};

use super::{HookRegistry, ProgramHandle};
use crate::{core::events::Publisher, helpers::signals::Running};

/// Timeout when polling for new events from BPF.
const BPF_EVENTS_POLL_TIMEOUT_MS: u64 = 200;
/// Name of the ring buffer map programs write their events to.
const EVENTS_MAP: &str = "events";

struct Loaded {
    /// Kept alive for as long as we poll its maps.
    object: libbpf_rs::Object,
    link: Option<libbpf_rs::Link>,
}

pub(crate) struct BpfRegistry {
    /// Loaded objects, keyed by hook id.
    objects: BTreeMap<u32, Loaded>,
    /// Kernel functions fentry/fexit can attach to.
    ksyms: HashSet<String>,
    run_state: Option<Running>,
    poller: Option<JoinHandle<()>>,
}

impl BpfRegistry {
    pub(crate) fn new() -> Result<Self> {
        raise_memlock_limit()?;

        Ok(BpfRegistry {
            objects: BTreeMap::new(),
            ksyms: kernel_functions()?,
            run_state: None,
            poller: None,
        })
    }
}

/// Loading BPF objects on kernels before 5.11 accounts their memory against
/// RLIMIT_MEMLOCK.
fn raise_memlock_limit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };

    // Safety: rlimit is a valid, initialized struct.
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Could not raise RLIMIT_MEMLOCK: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

fn kernel_functions() -> Result<HashSet<String>> {
    let kallsyms = fs::read_to_string("/proc/kallsyms")
        .map_err(|e| anyhow!("Could not read /proc/kallsyms: {e}"))?;

    Ok(kallsyms
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let (_, r#type, name) = (fields.next()?, fields.next()?, fields.next()?);
            matches!(r#type, "t" | "T").then(|| name.to_string())
        })
        .collect())
}

fn ifindex(name: &str) -> Result<i32> {
    Ok(nix::net::if_::if_nametoindex(name)
        .map_err(|e| anyhow!("Unknown interface {name}: {e}"))? as i32)
}

impl HookRegistry for BpfRegistry {
    fn recognizes(&self, hook: &str, kind: ProbeKind) -> bool {
        match kind {
            ProbeKind::Standalone => ifindex(hook).is_ok(),
            ProbeKind::Entry | ProbeKind::Exit => self.ksyms.contains(hook),
        }
    }

    fn traces_programs(&self) -> bool {
        true
    }

    fn register(&mut self, hook: &str, kind: ProbeKind, program: &ProgramHandle) -> Result<()> {
        let name = program.descriptor.id();

        // Entry/exit programs trace either a registered standalone program
        // or a kernel function.
        let (target_fd, target_func) = match &program.target {
            Some(target) => {
                let fd = self
                    .objects
                    .get(&target.hook_id)
                    .and_then(|loaded| {
                        loaded
                            .object
                            .progs()
                            .find(|p| p.name() == target.name.as_str())
                            .map(|p| p.as_fd().as_raw_fd())
                    })
                    .ok_or_else(|| anyhow!("Target program {} is not loaded", target.name))?;
                (fd, target.name.clone())
            }
            None => (0, hook.to_string()),
        };

        let mut open_obj = libbpf_rs::ObjectBuilder::default().open_memory(&program.blob)?;
        // Objects can hold several programs, only load ours.
        let mut found = false;
        for mut open_prog in open_obj.progs_mut() {
            let ours = open_prog.name() == name;
            open_prog.set_autoload(ours);
            if !ours {
                continue;
            }
            found = true;

            match kind {
                ProbeKind::Entry | ProbeKind::Exit => {
                    open_prog.set_attach_type(match kind {
                        ProbeKind::Entry => libbpf_rs::ProgramAttachType::TraceFentry,
                        _ => libbpf_rs::ProgramAttachType::TraceFexit,
                    });
                    open_prog.set_attach_target(target_fd, Some(target_func.clone()))?;
                }
                ProbeKind::Standalone => open_prog.set_prog_type(libbpf_rs::ProgramType::Xdp),
            }
        }
        if !found {
            bail!("Couldn't find program {name} in object");
        }

        let mut object = open_obj.load()?;
        if !object.maps().any(|m| m.name() == EVENTS_MAP) {
            bail!("Object has no '{EVENTS_MAP}' map");
        }

        let prog = object
            .progs_mut()
            .find(|p| p.name() == name)
            .ok_or_else(|| anyhow!("Couldn't get program {name}"))?;
        let link = match kind {
            ProbeKind::Standalone => prog.attach_xdp(ifindex(hook)?)?,
            _ => prog.attach_trace()?,
        };

        match &program.target {
            Some(t) => debug!("Attached BPF program {name} to {kind}:{} (program)", t.name),
            None => debug!("Attached BPF program {name} to {kind}:{hook}"),
        }
        self.objects.insert(
            program.hook_id,
            Loaded {
                object,
                link: Some(link),
            },
        );
        Ok(())
    }

    fn unregister(&mut self, program: &ProgramHandle) -> Result<()> {
        let loaded = self
            .objects
            .get_mut(&program.hook_id)
            .ok_or_else(|| anyhow!("program {} is not registered", program.hook_id))?;

        // The object itself is released with the event poller, as its ring
        // buffer can still hold events.
        match loaded.link.take() {
            Some(link) => {
                drop(link);
                Ok(())
            }
            None => bail!("program {} already detached", program.hook_id),
        }
    }

    fn start_events(&mut self, publisher: Publisher) -> Result<()> {
        if self.poller.is_some() {
            bail!("Events already started");
        }
        if self.objects.is_empty() {
            warn!("No BPF object loaded, no event will be reported");
        }

        let publisher = Arc::new(Mutex::new(publisher));
        let run_state = Running::ignore_signals();

        let maps: Vec<(u32, libbpf_rs::Map)> = self
            .objects
            .iter()
            .filter_map(|(hook_id, loaded)| {
                loaded
                    .object
                    .maps()
                    .find(|m| m.name() == EVENTS_MAP)
                    .map(|m| (*hook_id, m))
            })
            .collect();

        let mut builder = libbpf_rs::RingBufferBuilder::new();
        for (hook_id, map) in maps.iter() {
            let hook_id = *hook_id;
            let publisher = Arc::clone(&publisher);
            let rs = run_state.clone();

            builder.add(map, move |data: &[u8]| -> i32 {
                // Return EINTR on termination, to exit the current poll even
                // when events keep flowing.
                if !rs.running() {
                    return -libc::EINTR;
                }

                match EventRecord::from_raw(hook_id, data) {
                    Ok(record) => {
                        publisher
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .publish(&record);
                    }
                    Err(e) => error!("Could not parse raw event: {e}"),
                }
                0
            })?;
        }
        let rb = builder.build()?;

        let rs = run_state.clone();
        self.poller = Some(
            thread::Builder::new()
                .name("hookwire-bpf-poll".to_string())
                .spawn(move || {
                    while rs.running() {
                        if let Err(e) = rb.poll(Duration::from_millis(BPF_EVENTS_POLL_TIMEOUT_MS)) {
                            match e.kind() {
                                libbpf_rs::ErrorKind::Interrupted => (),
                                _ => error!("Unexpected error while polling ({e})"),
                            }
                        }
                    }
                })?,
        );
        self.run_state = Some(run_state);
        Ok(())
    }

    fn stop_events(&mut self) -> Result<()> {
        if let Some(run_state) = self.run_state.take() {
            run_state.terminate();
        }

        self.poller.take().map_or(Ok(()), |th| {
            th.join()
                .map_err(|_| anyhow!("while joining bpf event thread"))
        })?;

        self.objects.clear();
        Ok(())
    }
}

impl Drop for BpfRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.stop_events() {
            error!("{e}");
        }
    }
}
