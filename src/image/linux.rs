use std::fs::File;
use std::path::Path;

use goblin::elf::note::NT_GNU_BUILD_ID;
use goblin::elf::Elf;
use memmap::MmapOptions;

use crate::error::{Error, Result};
use crate::types::Diagnostic;

/// What the symbolizer is going to find in an executable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// GNU build ID, upper case hex.
    pub build_id: Option<String>,
    /// A `.symtab` or `.dynsym` with at least one entry.
    pub has_symbols: bool,
    /// DWARF line tables are embedded.
    pub has_debug_info: bool,
    /// Debug info lives in a separate file the symbolizer can follow.
    pub has_debug_link: bool,
}

impl ImageInfo {
    /// Maps the file at `path` and reads its ELF headers.
    pub fn inspect(path: &Path) -> Result<ImageInfo> {
        let io_error = |source| Error::Io {
            path: path.to_owned(),
            source,
        };
        let file = File::open(path).map_err(io_error)?;
        if file.metadata().map_err(io_error)?.len() == 0 {
            // Zero-length mappings are rejected, let the ELF parser complain instead.
            return Self::parse(path, &[]);
        }
        let mapped = unsafe { MmapOptions::new().map(&file) }.map_err(io_error)?;
        Self::parse(path, &mapped)
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<ImageInfo> {
        let elf = Elf::parse(bytes).map_err(|source| Error::Parse {
            path: path.to_owned(),
            source,
        })?;

        let has_section = |wanted: &[&str]| {
            elf.section_headers.iter().any(|header| {
                elf.shdr_strtab
                    .get_at(header.sh_name)
                    .map_or(false, |name| wanted.contains(&name))
            })
        };
        let has_debug_info = has_section(&[".debug_info", ".zdebug_info"]);
        let has_debug_link = has_section(&[".gnu_debuglink", ".gnu_debugaltlink"]);
        let has_symbols = !elf.syms.is_empty() || !elf.dynsyms.is_empty();

        Ok(ImageInfo {
            build_id: build_id(&elf, bytes),
            has_symbols,
            has_debug_info,
            has_debug_link,
        })
    }

    /// The complaint the symbolizer would raise about this image, if any. Frames still get their
    /// program counters either way.
    pub fn diagnostic(&self) -> Option<Diagnostic> {
        if !self.has_symbols {
            Some(Diagnostic::new("no symbol table in ELF executable", -1))
        } else if !self.has_debug_info && !self.has_debug_link {
            Some(Diagnostic::new("no debug info in ELF executable", -1))
        } else {
            None
        }
    }
}

fn build_id(elf: &Elf, bytes: &[u8]) -> Option<String> {
    // PT_NOTE segments are always loaded, so this works on stripped binaries too.
    for note in elf.iter_note_headers(bytes)? {
        let note = match note {
            Ok(note) => note,
            Err(_) => break,
        };
        if note.name == "GNU" && note.n_type == NT_GNU_BUILD_ID {
            return Some(hex::encode_upper(note.desc));
        }
    }
    None
}
