//! faultline prints a symbolized backtrace of the faulting thread to stderr when the process
//! receives a fatal signal, then lets the default action of that signal run (usually termination
//! and maybe a core dump).
//!
//! ```no_run
//! faultline::install(faultline::DEFAULT_SIGNAL);
//! ```
//!
//! Every stack level becomes one line:
//!
//! ```text
//! 0x55d4c0ffee, myapp::worker::run at src/worker.rs:42
//! ```
//!
//! The function clause is missing when the symbol is unknown and the location clause is missing
//! when there is no debug info. Rust symbol names are demangled.
//!
//! Only Linux has a real implementation. Elsewhere every function is a no-op.
//!
//! Threads faulting at the same time on the same signal write to stderr without coordination,
//! so their lines can interleave. Manual traces (`trace_to`, `print`) are different: they take the
//! unwinder's global lock and run one after the other. The crash handler never takes that lock.

#[cfg(target_os = "linux")]
mod lib_linux;
#[cfg(target_os = "linux")]
pub use crate::lib_linux::*;

#[cfg(not(target_os = "linux"))]
mod lib_stub;
#[cfg(not(target_os = "linux"))]
pub use crate::lib_stub::*;

pub mod error;
pub mod format;
pub mod output;
pub mod types;

#[cfg(target_os = "linux")]
pub mod image;

pub use crate::error::{Error, Result};
pub use crate::output::{Reporter, StderrReporter};
pub use crate::types::{Diagnostic, Frame};

/// The signal the handler is conventionally installed for.
pub const DEFAULT_SIGNAL: libc::c_int = libc::SIGILL;
