use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::Diagnostic;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not locate the running executable")]
    NoExecutable,

    #[error("failed to read executable image {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[cfg(target_os = "linux")]
    #[error("executable image {} is not a readable ELF file: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: goblin::error::Error,
    },

    #[cfg(target_os = "linux")]
    #[error("{signal} is not a valid signal number")]
    InvalidSignal {
        signal: libc::c_int,
        #[source]
        source: nix::Error,
    },

    #[cfg(target_os = "linux")]
    #[error("failed to install crash handler for signal {signal}: {source}")]
    Install {
        signal: libc::c_int,
        #[source]
        source: nix::Error,
    },
}

impl Error {
    /// The line reported at capture time when the executable image could not be inspected.
    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            Error::NoExecutable => Diagnostic::new("could not locate the running executable", -1),
            Error::Io { source, .. } => Diagnostic::new(
                "failed to open executable image",
                source.raw_os_error().unwrap_or(-1),
            ),
            #[cfg(target_os = "linux")]
            Error::Parse { .. } => Diagnostic::new("executable image is not a readable ELF file", -1),
            #[cfg(target_os = "linux")]
            Error::InvalidSignal { .. } | Error::Install { .. } => {
                Diagnostic::new("failed to install crash handler", -1)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
