use std::fmt::{self, Write};

use rustc_demangle::try_demangle;

use crate::types::{Diagnostic, Frame};

/// Size of the stack buffer one trace line is rendered into.
pub const LINE_CAPACITY: usize = 4096;

/// Symbol prefixes rustc emits for legacy (`_ZN`) and v0 (`_R`) mangling. Mach-O adds a leading
/// underscore.
const MANGLING_MARKERS: &[&str] = &["_ZN", "__ZN", "_R", "__R"];

pub fn has_mangling_marker(name: &str) -> bool {
    MANGLING_MARKERS.iter().any(|marker| name.starts_with(marker))
}

/// Writes `name` demangled when it is a mangled Rust symbol, verbatim otherwise.
fn write_function<W: Write>(out: &mut W, name: &str) -> fmt::Result {
    if has_mangling_marker(name) {
        if let Ok(demangled) = try_demangle(name) {
            // The alternate form drops the trailing hash.
            return write!(out, "{:#}", demangled);
        }
    }
    out.write_str(name)
}

/// Writes `bytes` with every invalid UTF-8 sequence replaced by U+FFFD, without allocating.
fn write_lossy<W: Write>(out: &mut W, mut bytes: &[u8]) -> fmt::Result {
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => return out.write_str(valid),
            Err(err) => {
                let (valid, rest) = bytes.split_at(err.valid_up_to());
                out.write_str(std::str::from_utf8(valid).unwrap_or_default())?;
                out.write_char(char::REPLACEMENT_CHARACTER)?;
                match err.error_len() {
                    Some(len) => bytes = &rest[len..],
                    // Truncated sequence at the end.
                    None => return Ok(()),
                }
            }
        }
    }
}

/// `0x<pc>[, <function>][ at <file>:<line>]`, without the newline.
impl<'a> fmt::Display for Frame<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.pc)?;
        if let Some(function) = self.function {
            f.write_str(", ")?;
            match std::str::from_utf8(function) {
                Ok(name) => write_function(f, name)?,
                // Mangled Rust names are ASCII, so there is nothing to demangle here.
                Err(_) => write_lossy(f, function)?,
            }
        }
        if let Some(file) = self.file {
            write!(f, " at {}:{}", file.display(), self.line.unwrap_or(0))?;
        }
        Ok(())
    }
}

/// A fixed-size line that never touches the heap.
///
/// Text past the capacity is dropped at a char boundary. One byte is always held back so that
/// `finish` can terminate the line.
pub struct LineBuffer {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    pub const fn new() -> Self {
        LineBuffer {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn finish(&mut self) {
        self.buf[self.len] = b'\n';
        self.len += 1;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = (LINE_CAPACITY - 1).saturating_sub(self.len);
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        // Truncation is silent, a partial line beats no line.
        Ok(())
    }
}

/// Renders `frame` as one newline-terminated line into `out`, replacing its previous contents.
pub fn format_frame(frame: &Frame, out: &mut LineBuffer) {
    out.clear();
    let _ = write!(out, "{}", frame);
    out.finish();
}

pub fn format_diagnostic(diagnostic: &Diagnostic, out: &mut LineBuffer) {
    out.clear();
    let _ = write!(out, "{}", diagnostic);
    out.finish();
}
