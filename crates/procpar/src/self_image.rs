//! The running executable, captured once, as the target for worker launches.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::orchestrator::DispatchError;

static CURRENT: OnceLock<SelfImage> = OnceLock::new();

/// Executable path plus the arguments this process was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfImage {
    executable: Result<PathBuf, String>,
    forwarded_args: Vec<String>,
}

impl SelfImage {
    pub fn new(executable: impl Into<PathBuf>, forwarded_args: Vec<String>) -> Self {
        Self {
            executable: Ok(executable.into()),
            forwarded_args,
        }
    }

    /// The image of this process, captured on first use.
    pub fn current() -> &'static SelfImage {
        CURRENT.get_or_init(Self::capture)
    }

    fn capture() -> Self {
        let executable = std::env::current_exe().map_err(|e| e.to_string());
        let forwarded_args = std::env::args_os()
            .skip(1)
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        tracing::debug!(?executable, "Captured self image");
        Self {
            executable,
            forwarded_args,
        }
    }

    /// Path to launch workers from; must be an existing regular file.
    pub fn executable(&self) -> Result<&Path, DispatchError> {
        let path = self
            .executable
            .as_ref()
            .map_err(|reason| DispatchError::EntryPointUnresolvable {
                reason: format!("cannot locate current executable: {reason}"),
            })?;

        if !path.is_file() {
            return Err(DispatchError::EntryPointUnresolvable {
                reason: format!("{} is not an executable file", path.display()),
            });
        }
        Ok(path)
    }

    pub fn forwarded_args(&self) -> &[String] {
        &self.forwarded_args
    }
}
