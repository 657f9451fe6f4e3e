use std::fmt;
use std::path::Path;

/// One stack level as handed out by the unwinder.
///
/// Frames borrow their strings from the unwinder's symbol cache and only live for the duration of
/// the per-frame callback, so they are formatted and dropped right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame<'a> {
    pub pc: usize,
    pub file: Option<&'a Path>,
    pub line: Option<u32>,
    /// Raw symbol bytes. Possibly mangled, and not necessarily UTF-8.
    pub function: Option<&'a [u8]>,
}

impl<'a> Frame<'a> {
    /// A frame the unwinder could not symbolize.
    pub fn bare(pc: usize) -> Self {
        Frame {
            pc,
            file: None,
            line: None,
            function: None,
        }
    }
}

/// A failure reported by the unwinding machinery itself, e.g. an unreadable symbol table.
///
/// `code` is an errno when positive and -1 when there is no OS error behind the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: &'static str,
    pub code: i32,
}

impl Diagnostic {
    pub const fn new(message: &'static str, code: i32) -> Self {
        Diagnostic { message, code }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.message)?;
        if self.code > 0 {
            write!(f, " (errno {})", self.code)?;
        }
        Ok(())
    }
}
