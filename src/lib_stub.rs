//! Platforms without a supported unwinder. Everything is accepted and nothing is printed.

use crate::error::Result;
use crate::output::Reporter;

pub fn try_install(_signal: libc::c_int) -> Result<()> {
    Ok(())
}

pub fn install(_signal: libc::c_int) {}

pub fn trace_to(_reporter: &mut dyn Reporter) {}

#[deprecated(note = "meant for debugging the handler itself, and will be removed")]
pub fn print() {}
