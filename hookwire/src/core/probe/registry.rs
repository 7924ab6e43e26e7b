//! # Host registry
//!
//! Interfaces to the host environment: the hook registry installing programs
//! and the source of the programs themselves. Both are injected, the core
//! never reaches to global state.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Result};
use events::ProbeKind;

use super::ProbeDescriptor;
use crate::core::events::Publisher;

/// A loaded program, ready to be registered on a hook.
#[derive(Clone)]
pub(crate) struct ProgramHandle {
    /// Identifier the host stamps in every record the program produces.
    pub(crate) hook_id: u32,
    pub(crate) descriptor: Arc<ProbeDescriptor>,
    /// Compiled program, opaque to us.
    pub(crate) blob: Arc<[u8]>,
    /// Set for entry/exit programs tracing another registered program.
    pub(crate) target: Option<ProgramTarget>,
}

/// A registered standalone program an entry/exit program attaches to, in
/// place of a kernel function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ProgramTarget {
    /// Hook id the target was registered with.
    pub(crate) hook_id: u32,
    /// Target program name, i.e. its probe id.
    pub(crate) name: String,
}

/// Trait representing the host environment hook registry. Only the
/// attachment manager calls it.
pub(crate) trait HookRegistry {
    /// Is the hook known for the given kind of probes?
    fn recognizes(&self, hook: &str, kind: ProbeKind) -> bool;
    /// Can entry/exit programs attach to other registered programs?
    fn traces_programs(&self) -> bool {
        false
    }
    /// Install a program on a hook. Errors are deterministic rejections (e.g.
    /// verifier or permission failures) and are not retried.
    fn register(&mut self, hook: &str, kind: ProbeKind, program: &ProgramHandle) -> Result<()>;
    /// Remove a previously registered program.
    fn unregister(&mut self, program: &ProgramHandle) -> Result<()>;
    /// Start delivering events of registered programs to the channel.
    fn start_events(&mut self, publisher: Publisher) -> Result<()>;
    /// Stop delivering events, releasing the publisher.
    fn stop_events(&mut self) -> Result<()>;
}

/// Source of the compiled programs, keyed by probe descriptor id.
pub(crate) trait ArtifactSource {
    fn load(&self, id: &str) -> Result<Vec<u8>>;
}

/// Programs stored as `<dir>/<id>.o`.
pub(crate) struct ArtifactDir(pub(crate) PathBuf);

impl ArtifactSource for ArtifactDir {
    fn load(&self, id: &str) -> Result<Vec<u8>> {
        let file = format!("{id}.o");
        if id.is_empty() || id.contains("..") || Path::new(&file).components().count() != 1 {
            bail!("invalid artifact name '{file}'");
        }
        let path = self.0.join(file);
        fs::read(&path).map_err(|e| anyhow!("could not read '{}': {e}", path.display()))
    }
}

/// For hosts not needing any program (e.g. the simulated one).
pub(crate) struct NoArtifacts;

impl ArtifactSource for NoArtifacts {
    fn load(&self, _: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    #[test]
    fn artifact_dir() {
        let dir = env::temp_dir().join(format!("hookwire-artifacts-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("fentry_xdp.o"), [0x7f, b'E', b'L', b'F']).unwrap();

        let artifacts = ArtifactDir(dir.clone());
        assert_eq!(artifacts.load("fentry_xdp").unwrap(), vec![0x7f, b'E', b'L', b'F']);
        assert!(artifacts.load("fexit_xdp").is_err());

        // Stay in the artifact directory.
        fs::write(dir.with_extension("o"), [0]).unwrap();
        let name = dir.file_name().unwrap().to_str().unwrap().to_string();
        assert!(artifacts.load(&format!("../{name}")).is_err());
        assert!(artifacts.load("/etc/passwd").is_err());
        fs::remove_file(dir.with_extension("o")).unwrap();

        fs::remove_dir_all(&dir).unwrap();
    }
}
