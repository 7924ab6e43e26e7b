//! Pid file handling, used by `stop` to find the running instance.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Result};
use log::warn;
use nix::unistd::{getpid, Pid};

/// A pid file written with our own pid. It is removed on drop.
pub(crate) struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub(crate) fn create(path: &Path) -> Result<PidFile> {
        if let Ok(pid) = read_pid(path) {
            if nix::sys::signal::kill(pid, None).is_ok() {
                bail!(
                    "Another instance seems to be running (pid {pid}, from {})",
                    path.display()
                );
            }
        }

        fs::write(path, format!("{}\n", getpid()))
            .map_err(|e| anyhow!("Could not write pid file '{}': {e}", path.display()))?;

        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove pid file '{}': {e}", self.path.display());
        }
    }
}

pub(crate) fn read_pid(path: &Path) -> Result<Pid> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow!("Could not read pid file '{}': {e}", path.display()))?;
    let pid = content
        .trim()
        .parse::<i32>()
        .map_err(|e| anyhow!("Invalid pid file '{}': {e}", path.display()))?;

    if pid <= 0 {
        bail!("Invalid pid {pid} in '{}'", path.display());
    }
    Ok(Pid::from_raw(pid))
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("hookwire-{}-{name}.pid", std::process::id()))
    }

    #[test]
    fn create_and_remove() {
        let path = tmp_path("create");
        {
            let _pidfile = PidFile::create(&path).unwrap();
            assert_eq!(read_pid(&path).unwrap(), getpid());
            // We're alive, a second instance can't start.
            assert!(PidFile::create(&path).is_err());
        }
        assert!(!path.exists());
    }

    #[test]
    fn invalid_content() {
        let path = tmp_path("invalid");
        fs::write(&path, "not a pid").unwrap();
        assert!(read_pid(&path).is_err());
        fs::write(&path, "-3").unwrap();
        assert!(read_pid(&path).is_err());
        fs::remove_file(&path).unwrap();

        assert!(read_pid(&path).is_err());
    }
}
