use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::Result;
use events::{Decoders, ProbeKind};
use log::{debug, info, warn};

use super::{ArtifactSource, HookRegistry, ProbeDescriptor, ProgramHandle, ProgramTarget};
use crate::core::{events::Publisher, Error};

/// Opaque reference to an attachment owned by the manager. Its value is the
/// hook id stamped in the records of the attached probe.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct HandleId(u32);

impl HandleId {
    pub(crate) fn hook_id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Attachment lifecycle. Detached and Failed are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AttachmentState {
    Attaching,
    Active,
    Detaching,
    Detached,
    Failed,
}

impl AttachmentState {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, AttachmentState::Detached | AttachmentState::Failed)
    }

    pub(crate) fn can_become(&self, next: AttachmentState) -> bool {
        use AttachmentState::*;
        match (self, next) {
            (Attaching, Active) | (Active, Detaching) | (Detaching, Detached) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// A live (or retired) attachment.
pub(crate) struct AttachmentHandle {
    id: HandleId,
    descriptor: Arc<ProbeDescriptor>,
    state: AttachmentState,
    /// Installed program; released once the handle reaches a terminal state.
    program: Option<ProgramHandle>,
}

impl AttachmentHandle {
    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn descriptor(&self) -> &Arc<ProbeDescriptor> {
        &self.descriptor
    }

    pub(crate) fn state(&self) -> AttachmentState {
        self.state
    }

    fn set_state(&mut self, next: AttachmentState) {
        debug_assert!(
            self.state.can_become(next),
            "invalid transition {:?} -> {next:?}",
            self.state
        );
        debug!(
            "Probe {} {}: {:?} -> {next:?}",
            self.descriptor.id(),
            self.id,
            self.state
        );

        self.state = next;
        if next.is_terminal() {
            self.program = None;
        }
    }
}

/// AttachmentManager owns every attachment and is the only user of the host
/// hook registry. It guarantees a single active attachment per (hook, kind)
/// pair.
///
/// Handles reaching a terminal state release their program but are kept
/// around, so detaching them again is a no-op and their final state can
/// still be queried.
pub(crate) struct AttachmentManager {
    registry: Box<dyn HookRegistry>,
    artifacts: Box<dyn ArtifactSource>,
    handles: HashMap<HandleId, AttachmentHandle>,
    /// Active handles, indexed by their attach point.
    active: HashMap<(String, ProbeKind), HandleId>,
    /// Active handles in attach order.
    order: Vec<HandleId>,
    next_id: u32,
}

impl AttachmentManager {
    pub(crate) fn new(registry: Box<dyn HookRegistry>, artifacts: Box<dyn ArtifactSource>) -> Self {
        AttachmentManager {
            registry,
            artifacts,
            handles: HashMap::new(),
            active: HashMap::new(),
            order: Vec::new(),
            next_id: 1,
        }
    }

    /// Validate a descriptor against the host registry and the known schemas.
    /// Entry/exit probes can also name a standalone probe as their hook, if
    /// the host supports it. That probe must be active or part of `pending`,
    /// the descriptors to be attached before this one.
    pub(crate) fn validate(
        &self,
        descriptor: &ProbeDescriptor,
        decoders: &Decoders,
        pending: &[ProbeDescriptor],
    ) -> Result<(), Error> {
        descriptor.validate_with(decoders, |hook, kind| {
            if self.registry.recognizes(hook, kind) {
                return true;
            }
            is_tracing(kind)
                && self.registry.traces_programs()
                && (self.program_target(hook).is_some()
                    || pending
                        .iter()
                        .any(|p| p.kind() == ProbeKind::Standalone && p.id() == hook))
        })
    }

    /// Active standalone probe with the given id, as a tracing target.
    fn program_target(&self, id: &str) -> Option<ProgramTarget> {
        self.order
            .iter()
            .filter_map(|h| self.handles.get(h))
            .find(|h| h.descriptor.kind() == ProbeKind::Standalone && h.descriptor.id() == id)
            .map(|h| ProgramTarget {
                hook_id: h.id.hook_id(),
                name: h.descriptor.id().to_string(),
            })
    }

    /// Attach a probe. On success the returned handle is active.
    pub(crate) fn attach(&mut self, descriptor: Arc<ProbeDescriptor>) -> Result<HandleId, Error> {
        let key = (descriptor.hook().to_string(), descriptor.kind());
        if self.active.contains_key(&key) {
            return Err(Error::AlreadyAttached {
                hook: key.0,
                kind: key.1,
            });
        }

        let blob = self
            .artifacts
            .load(descriptor.id())
            .map_err(|e| Error::AttachRejected {
                probe: descriptor.id().to_string(),
                reason: format!("{e:#}"),
            })?;

        let id = HandleId(self.next_id);
        self.next_id += 1;

        // An active standalone probe named as hook takes precedence over a
        // kernel function of the same name.
        let target = if is_tracing(descriptor.kind()) && self.registry.traces_programs() {
            self.program_target(descriptor.hook())
        } else {
            None
        };
        if let Some(target) = &target {
            debug!(
                "Probe {} traces program {} (hook id {})",
                descriptor.id(),
                target.name,
                target.hook_id
            );
        }

        let program = ProgramHandle {
            hook_id: id.hook_id(),
            descriptor: Arc::clone(&descriptor),
            blob: blob.into(),
            target,
        };
        let mut handle = AttachmentHandle {
            id,
            descriptor: Arc::clone(&descriptor),
            state: AttachmentState::Attaching,
            program: None,
        };

        debug!("Attaching probe {descriptor}");
        let res = self
            .registry
            .register(descriptor.hook(), descriptor.kind(), &program);

        match res {
            Ok(()) => {
                handle.program = Some(program);
                handle.set_state(AttachmentState::Active);
                self.handles.insert(id, handle);
                self.active.insert(key, id);
                self.order.push(id);

                info!("Attached probe {descriptor}");
                Ok(id)
            }
            Err(e) => {
                handle.set_state(AttachmentState::Failed);
                self.handles.insert(id, handle);

                Err(Error::AttachRejected {
                    probe: descriptor.id().to_string(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Detach a probe. Detaching a handle in a terminal state is a no-op. On
    /// host error the handle is marked as failed, but is still no longer
    /// active.
    pub(crate) fn detach(&mut self, id: HandleId) -> Result<(), Error> {
        let handle = match self.handles.get_mut(&id) {
            Some(handle) => handle,
            None => {
                return Err(Error::DetachFailed {
                    probe: id.to_string(),
                    reason: "unknown handle".to_string(),
                })
            }
        };

        if handle.state.is_terminal() {
            return Ok(());
        }

        handle.set_state(AttachmentState::Detaching);
        let res = match &handle.program {
            Some(program) => self.registry.unregister(program),
            None => Ok(()),
        };

        let key = (
            handle.descriptor.hook().to_string(),
            handle.descriptor.kind(),
        );
        if self.active.get(&key) == Some(&id) {
            self.active.remove(&key);
        }
        self.order.retain(|h| *h != id);

        match res {
            Ok(()) => {
                handle.set_state(AttachmentState::Detached);
                info!("Detached probe {}", handle.descriptor);
                Ok(())
            }
            Err(e) => {
                handle.set_state(AttachmentState::Failed);
                Err(Error::DetachFailed {
                    probe: handle.descriptor.id().to_string(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Detach all active probes, in reverse attach order. Failures do not
    /// prevent the remaining probes from being detached; they are all
    /// returned.
    pub(crate) fn detach_all(&mut self) -> Vec<Error> {
        let mut errors = Vec::new();

        for id in self.order.clone().into_iter().rev() {
            if let Err(e) = self.detach(id) {
                warn!("{e}");
                errors.push(e);
            }
        }

        errors
    }

    pub(crate) fn state(&self, id: HandleId) -> Option<AttachmentState> {
        self.handles.get(&id).map(|h| h.state())
    }

    pub(crate) fn handle(&self, id: HandleId) -> Option<&AttachmentHandle> {
        self.handles.get(&id)
    }

    pub(crate) fn descriptor(&self, id: HandleId) -> Option<&Arc<ProbeDescriptor>> {
        self.handles.get(&id).map(|h| h.descriptor())
    }

    /// Active handles, in attach order.
    pub(crate) fn active(&self) -> &[HandleId] {
        &self.order
    }

    /// Map of the active hook ids to their descriptors, used to decode
    /// records.
    pub(crate) fn schema_table(&self) -> HashMap<u32, Arc<ProbeDescriptor>> {
        self.order
            .iter()
            .filter_map(|id| self.handles.get(id))
            .map(|h| (h.id.hook_id(), Arc::clone(&h.descriptor)))
            .collect()
    }

    /// Hand the channel's publisher over to the host.
    pub(crate) fn start_events(&mut self, publisher: Publisher) -> Result<()> {
        self.registry.start_events(publisher)
    }

    pub(crate) fn stop_events(&mut self) -> Result<()> {
        self.registry.stop_events()
    }
}

fn is_tracing(kind: ProbeKind) -> bool {
    matches!(kind, ProbeKind::Entry | ProbeKind::Exit)
}
