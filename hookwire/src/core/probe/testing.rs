//! Fake host registry, for unit tests.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use events::{EventRecord, ProbeKind};

use super::{HookRegistry, ProgramHandle, ProgramTarget};
use crate::core::events::Publisher;

#[derive(Default)]
struct FakeState {
    hooks: HashSet<String>,
    rejected: HashSet<String>,
    fail_unregister: bool,
    registered: usize,
    traces_programs: bool,
    /// Registered probe ids with their tracing target, in call order.
    targets: Vec<(String, Option<ProgramTarget>)>,
    unregister_log: Vec<String>,
    publisher: Option<Publisher>,
    events_stopped: bool,
    /// Published while unregistering, as a hook firing late would.
    late_record: Option<EventRecord>,
}

/// Records every call; clones share the same state so tests can inspect it
/// after handing a clone to the code under test.
#[derive(Clone, Default)]
pub(crate) struct FakeRegistry(Arc<Mutex<FakeState>>);

impl FakeRegistry {
    pub(crate) fn new(hooks: &[&str]) -> Self {
        let registry = Self::default();
        registry.0.lock().unwrap().hooks = hooks.iter().map(|h| h.to_string()).collect();
        registry
    }

    /// Make the host refuse the probe with the given id.
    pub(crate) fn reject(&self, id: &str) {
        self.0.lock().unwrap().rejected.insert(id.to_string());
    }

    pub(crate) fn fail_unregister(&self, fail: bool) {
        self.0.lock().unwrap().fail_unregister = fail;
    }

    /// Publish `record` on the next unregister call.
    pub(crate) fn fire_on_unregister(&self, record: EventRecord) {
        self.0.lock().unwrap().late_record = Some(record);
    }

    pub(crate) fn set_traces_programs(&self, traces: bool) {
        self.0.lock().unwrap().traces_programs = traces;
    }

    pub(crate) fn targets(&self) -> Vec<(String, Option<ProgramTarget>)> {
        self.0.lock().unwrap().targets.clone()
    }

    pub(crate) fn registered(&self) -> usize {
        self.0.lock().unwrap().registered
    }

    pub(crate) fn unregistered(&self) -> usize {
        self.0.lock().unwrap().unregister_log.len()
    }

    /// Ids of the unregistered probes, in call order.
    pub(crate) fn unregister_log(&self) -> Vec<String> {
        self.0.lock().unwrap().unregister_log.clone()
    }

    pub(crate) fn events_stopped(&self) -> bool {
        self.0.lock().unwrap().events_stopped
    }

    /// Fire a hook: publish a record through the publisher we were given.
    pub(crate) fn fire(&self, record: EventRecord) -> bool {
        match self.0.lock().unwrap().publisher.as_mut() {
            Some(publisher) => publisher.publish(&record),
            None => false,
        }
    }
}

impl HookRegistry for FakeRegistry {
    fn recognizes(&self, hook: &str, _: ProbeKind) -> bool {
        self.0.lock().unwrap().hooks.contains(hook)
    }

    fn traces_programs(&self) -> bool {
        self.0.lock().unwrap().traces_programs
    }

    fn register(&mut self, _: &str, _: ProbeKind, program: &ProgramHandle) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if state.rejected.contains(program.descriptor.id()) {
            bail!("program rejected by the verifier");
        }
        state.registered += 1;
        state
            .targets
            .push((program.descriptor.id().to_string(), program.target.clone()));
        Ok(())
    }

    fn unregister(&mut self, program: &ProgramHandle) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state
            .unregister_log
            .push(program.descriptor.id().to_string());
        if let Some(record) = state.late_record.take() {
            if let Some(publisher) = state.publisher.as_mut() {
                publisher.publish(&record);
            }
        }
        if state.fail_unregister {
            bail!("link already gone");
        }
        Ok(())
    }

    fn start_events(&mut self, publisher: Publisher) -> Result<()> {
        self.0.lock().unwrap().publisher = Some(publisher);
        Ok(())
    }

    fn stop_events(&mut self) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.publisher = None;
        state.events_stopped = true;
        Ok(())
    }
}
