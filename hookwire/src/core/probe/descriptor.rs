use std::{fmt, str::FromStr};

use events::{Decoders, ProbeKind, SCHEMA_MARKER};
use serde::{Deserialize, Serialize};

use super::HookRegistry;
use crate::core::Error;

/// Identifies an attach point and the schema of the events a probe emits
/// there. Immutable once created.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ProbeDescriptor {
    /// Opaque id, also used to find the probe's program artifact.
    id: String,
    /// Name of the hook in the host environment.
    hook: String,
    kind: ProbeKind,
    #[serde(default = "default_schema_version")]
    schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_MARKER
}

impl ProbeDescriptor {
    pub(crate) fn new(id: &str, hook: &str, kind: ProbeKind, schema_version: u32) -> Self {
        ProbeDescriptor {
            id: id.to_string(),
            hook: hook.to_string(),
            kind,
            schema_version,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn hook(&self) -> &str {
        &self.hook
    }

    pub(crate) fn kind(&self) -> ProbeKind {
        self.kind
    }

    pub(crate) fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Check the descriptor can be attached: its schema must be known and its
    /// hook recognized by the host.
    pub(crate) fn validate(
        &self,
        registry: &dyn HookRegistry,
        decoders: &Decoders,
    ) -> Result<(), Error> {
        self.validate_with(decoders, |hook, kind| registry.recognizes(hook, kind))
    }

    /// Same as `validate`, with `recognizes` telling which hooks are known.
    pub(crate) fn validate_with<F>(&self, decoders: &Decoders, recognizes: F) -> Result<(), Error>
    where
        F: Fn(&str, ProbeKind) -> bool,
    {
        if self.id.is_empty() {
            return Err(Error::InvalidDescriptor("empty probe id".to_string()));
        }
        // Ids name program artifacts and BPF programs.
        if self.id.contains("..")
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(Error::InvalidDescriptor(format!(
                "invalid probe id '{}'",
                self.id
            )));
        }

        if self.hook.is_empty() || !recognizes(&self.hook, self.kind) {
            return Err(Error::InvalidHook {
                hook: self.hook.clone(),
                kind: self.kind,
            });
        }

        if !decoders.supports(self.schema_version) {
            return Err(Error::SchemaMismatch {
                version: self.schema_version,
                supported: decoders.versions(),
            });
        }

        Ok(())
    }
}

/// Parses `ID=KIND:HOOK[/vSCHEMA]`, e.g. `fentry_xdp=entry:dummy/v2`.
impl FromStr for ProbeDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: &str| Error::InvalidDescriptor(format!("'{s}': {msg}"));

        let (id, target) = s
            .split_once('=')
            .ok_or_else(|| invalid("expected ID=KIND:HOOK[/vSCHEMA]"))?;
        if id.is_empty() {
            return Err(invalid("empty probe id"));
        }

        let (kind, hook) = target
            .split_once(':')
            .ok_or_else(|| invalid("missing probe kind"))?;
        let kind = kind.parse::<ProbeKind>().map_err(|e| invalid(&e))?;

        let (hook, schema_version) = match hook.rsplit_once('/') {
            Some((hook, schema)) => {
                let version = schema
                    .strip_prefix('v')
                    .unwrap_or(schema)
                    .parse::<u32>()
                    .map_err(|_| invalid("invalid schema version"))?;
                (hook, version)
            }
            None => (hook, default_schema_version()),
        };
        if hook.is_empty() {
            return Err(invalid("empty hook name"));
        }

        Ok(ProbeDescriptor::new(id, hook, kind, schema_version))
    }
}

impl fmt::Display for ProbeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}, schema v{})",
            self.id, self.kind, self.hook, self.schema_version
        )
    }
}
