use std::convert::TryFrom;
use std::env;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};
use crate::format::{format_diagnostic, format_frame, LineBuffer};
use crate::image::ImageInfo;
use crate::output::{Reporter, StderrReporter};
use crate::types::{Diagnostic, Frame};

/// Everything the handler needs about the running executable, created once and never changed.
#[derive(Debug)]
pub struct UnwindState {
    executable: Option<PathBuf>,
    image: Option<ImageInfo>,
    diagnostic: Option<Diagnostic>,
}

impl UnwindState {
    fn new(executable: Option<PathBuf>) -> UnwindState {
        let inspected = executable
            .as_deref()
            .ok_or(Error::NoExecutable)
            .and_then(ImageInfo::inspect);
        let (image, diagnostic) = match inspected {
            Ok(image) => {
                let diagnostic = image.diagnostic();
                (Some(image), diagnostic)
            }
            Err(err) => {
                log::debug!("Could not inspect the executable image: {}", err);
                (None, Some(err.diagnostic()))
            }
        };

        // Loading debug info allocates a lot. Do it now rather than inside the first handler run.
        backtrace::resolve(capture as *const () as *mut c_void, |_| {});

        UnwindState {
            executable,
            image,
            diagnostic,
        }
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    pub fn image(&self) -> Option<&ImageInfo> {
        self.image.as_ref()
    }

    /// Reported at the start of every capture.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        self.diagnostic.as_ref()
    }
}

static STATE: OnceLock<UnwindState> = OnceLock::new();

fn executable_path() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .or_else(|| env::args_os().next().map(PathBuf::from))
}

/// Returns the process-wide state, creating it on first use.
///
/// Not safe to call for the first time from a signal handler. `try_install` calls it before
/// registering anything, so the handler only ever sees an initialized state.
pub fn unwind_state() -> &'static UnwindState {
    STATE.get_or_init(|| {
        let state = UnwindState::new(executable_path());
        log::debug!(
            "Unwind state ready for {:?} (build id {})",
            state.executable(),
            state
                .image()
                .and_then(|image| image.build_id.as_deref())
                .unwrap_or("unknown")
        );
        state
    })
}

/// How the unwinder is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Locking {
    /// Go through the unwinder's global lock, which makes concurrent manual traces safe.
    Locked,
    /// Skip the lock. The handler has to, since the fault may have hit while this very thread
    /// held it. Concurrent unlocked walks race on the symbol cache.
    Unlocked,
}

/// Walks the calling thread's stack and reports one line per symbol, innermost first.
///
/// Frames belonging to the unwinder and to this function are skipped, so the first line is
/// whoever called us.
#[inline(never)]
fn capture(state: &UnwindState, reporter: &mut dyn Reporter, locking: Locking) {
    let mut line = LineBuffer::new();

    if let Some(diagnostic) = state.diagnostic() {
        format_diagnostic(diagnostic, &mut line);
        reporter.emit(line.as_bytes());
    }

    let entry = capture as *const () as usize;
    if !walk(reporter, &mut line, Some(entry), locking) {
        // No frame could be matched to `capture`. Better too many frames than none.
        walk(reporter, &mut line, None, locking);
    }
}

/// Returns whether `skip_through` was found. Nothing is reported until it has been.
fn walk(
    reporter: &mut dyn Reporter,
    line: &mut LineBuffer,
    skip_through: Option<usize>,
    locking: Locking,
) -> bool {
    let mut skipping = skip_through.is_some();
    let mut stopped = false;

    let mut on_frame = |frame: &backtrace::Frame| -> bool {
        let pc = frame.ip() as usize;
        if pc == 0 {
            return false;
        }

        if skipping {
            if Some(frame.symbol_address() as usize) == skip_through {
                skipping = false;
            }
            return true;
        }

        let mut resolved = false;
        let mut on_symbol = |symbol: &backtrace::Symbol| {
            if stopped {
                return;
            }
            resolved = true;
            let name = symbol.name();
            let frame = Frame {
                pc,
                file: symbol.filename(),
                line: symbol.lineno(),
                function: name.as_ref().map(|name| name.as_bytes()),
            };
            format_frame(&frame, line);
            reporter.emit(line.as_bytes());
            stopped = reporter.after_frame().is_break();
        };
        match locking {
            Locking::Locked => backtrace::resolve_frame(frame, &mut on_symbol),
            Locking::Unlocked => unsafe {
                backtrace::resolve_frame_unsynchronized(frame, &mut on_symbol)
            },
        }

        if !resolved && !stopped {
            format_frame(&Frame::bare(pc), line);
            reporter.emit(line.as_bytes());
            stopped = reporter.after_frame().is_break();
        }

        !stopped
    };

    match locking {
        Locking::Locked => backtrace::trace(&mut on_frame),
        Locking::Unlocked => unsafe { backtrace::trace_unsynchronized(&mut on_frame) },
    }

    !skipping
}

extern "C" fn handle_fault(_signum: libc::c_int) {
    // Installation initializes the state first, so this is only empty if something raised our
    // signal before `try_install` got to registering the handler.
    if let Some(state) = STATE.get() {
        capture(state, &mut StderrReporter, Locking::Unlocked);
    }
}

/// Installs the crash handler for `signal`, replacing whatever was there before.
///
/// The handler does not block its own signal while running and resets to the default
/// disposition on delivery. A second fault therefore takes the default action (usually
/// termination) instead of looping back into the handler. Installing again re-registers.
pub fn try_install(signal: libc::c_int) -> Result<()> {
    let sig = Signal::try_from(signal).map_err(|source| Error::InvalidSignal { signal, source })?;

    unwind_state();

    let action = SigAction::new(
        SigHandler::Handler(handle_fault),
        SaFlags::SA_NODEFER | SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    unsafe { sigaction(sig, &action) }.map_err(|source| Error::Install { signal, source })?;

    log::debug!("Installed crash handler for {}", sig);
    Ok(())
}

/// Like `try_install`, but failures are only logged.
pub fn install(signal: libc::c_int) {
    if let Err(err) = try_install(signal) {
        log::warn!("{}", err);
    }
}

/// Runs the capture pipeline on the calling thread, reporting to `reporter`.
///
/// Unlike the crash handler, this goes through the unwinder's global lock, so concurrent manual
/// traces run one after the other.
pub fn trace_to(reporter: &mut dyn Reporter) {
    capture(unwind_state(), reporter, Locking::Locked);
}

/// Prints the current thread's backtrace to stderr, exactly like the crash handler would.
#[deprecated(note = "meant for debugging the handler itself, and will be removed")]
pub fn print() {
    trace_to(&mut StderrReporter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serial_test::serial;
    use std::ops::ControlFlow;

    fn line_grammar() -> Regex {
        Regex::new(r"^0x[0-9a-f]+(, .+)?( at .+:[0-9]+)?$").unwrap()
    }

    fn frame_lines(output: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(output);
        assert!(text.ends_with('\n'));
        let diagnostic = unwind_state().diagnostic().map(|d| d.to_string());
        text.lines()
            .filter(|line| Some(line.to_string()) != diagnostic)
            .map(str::to_string)
            .collect()
    }

    /// Stops after `limit` frames.
    struct Truncating {
        out: Vec<u8>,
        limit: usize,
        frames: usize,
    }

    impl Reporter for Truncating {
        fn emit(&mut self, text: &[u8]) {
            self.out.extend_from_slice(text);
        }

        fn after_frame(&mut self) -> ControlFlow<()> {
            self.frames += 1;
            if self.frames >= self.limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }

    #[inline(never)]
    fn outer_frame(out: &mut Vec<u8>) {
        inner_frame(out);
        std::hint::black_box(());
    }

    #[inline(never)]
    fn inner_frame(out: &mut Vec<u8>) {
        trace_to(out);
        std::hint::black_box(());
    }

    #[test]
    fn state_is_created_once() {
        let first = unwind_state();
        let second = unwind_state();
        assert!(std::ptr::eq(first, second));
        assert_eq!(
            first.executable(),
            env::current_exe().ok().as_deref()
        );
        assert!(first.image().is_some());
    }

    #[test]
    fn state_is_shared_across_threads() {
        let here = unwind_state() as *const UnwindState as usize;
        let there = std::thread::spawn(|| unwind_state() as *const UnwindState as usize)
            .join()
            .unwrap();
        assert_eq!(here, there);
    }

    #[test]
    fn missing_executable_becomes_a_diagnostic() {
        let state = UnwindState::new(None);
        assert!(state.image().is_none());
        assert_eq!(
            state.diagnostic(),
            Some(&Diagnostic::new("could not locate the running executable", -1))
        );
    }

    #[test]
    fn diagnostic_is_reported_before_frames() {
        let state = UnwindState::new(Some(PathBuf::from("/nonexistent/faultline")));
        let mut out = Vec::new();
        capture(&state, &mut out, Locking::Locked);
        let text = String::from_utf8_lossy(&out);
        let first = text.lines().next().expect("at least one line");
        assert_eq!(
            first,
            format!("failed to open executable image (errno {})", libc::ENOENT)
        );
        assert!(text.lines().skip(1).all(|line| line_grammar().is_match(line)));
    }

    #[test]
    fn trace_lines_are_well_formed() {
        let mut out = Vec::new();
        outer_frame(&mut out);
        let lines = frame_lines(&out);
        assert!(!lines.is_empty());
        for line in &lines {
            assert!(line_grammar().is_match(line), "malformed line {:?}", line);
        }
    }

    #[test]
    fn trace_is_innermost_first_and_demangled() {
        let mut out = Vec::new();
        outer_frame(&mut out);
        let lines = frame_lines(&out);

        let position = |needle: &str| lines.iter().position(|line| line.contains(needle));
        let inner = position("tests::inner_frame").expect("inner frame reported");
        let outer = position("tests::outer_frame").expect("outer frame reported");
        assert!(inner < outer);

        // The walk starts at the caller of the capture routine.
        assert!(lines[..inner]
            .iter()
            .all(|line| !line.contains("lib_linux::capture") && !line.contains("lib_linux::walk")));
        if cfg!(debug_assertions) {
            assert!(lines[0].contains("trace_to"), "first line was {:?}", lines[0]);
        }
        assert!(lines.iter().all(|line| !line.contains(", _ZN")));
    }

    #[test]
    fn reporter_can_stop_the_walk() {
        let mut reporter = Truncating {
            out: Vec::new(),
            limit: 2,
            frames: 0,
        };
        trace_to(&mut reporter);
        assert_eq!(reporter.frames, 2);
        assert_eq!(frame_lines(&reporter.out).len(), 2);
    }

    #[test]
    fn unmatched_skip_target_reports_nothing() {
        let mut out = Vec::new();
        assert!(!walk(&mut out, &mut LineBuffer::new(), Some(0), Locking::Locked));
        assert!(out.is_empty());
    }

    #[test]
    fn fallback_walk_reports_every_frame() {
        let mut out = Vec::new();
        assert!(walk(&mut out, &mut LineBuffer::new(), None, Locking::Locked));
        let text = String::from_utf8_lossy(&out);
        let lines: Vec<&str> = text.lines().collect();
        assert!(!lines.is_empty());
        for line in &lines {
            assert!(line_grammar().is_match(line), "malformed line {:?}", line);
        }
        // Nothing is skipped, so the walk itself shows up.
        if cfg!(debug_assertions) {
            assert!(lines.iter().any(|line| line.contains("lib_linux::walk")));
        }
    }

    #[test]
    fn trace_from_another_thread() {
        let out = std::thread::spawn(|| {
            let mut out = Vec::new();
            outer_frame(&mut out);
            out
        })
        .join()
        .unwrap();
        assert!(frame_lines(&out)
            .iter()
            .any(|line| line.contains("tests::inner_frame")));
    }

    #[test]
    fn invalid_signal_is_rejected() {
        assert!(matches!(
            try_install(-1),
            Err(Error::InvalidSignal { signal: -1, .. })
        ));
        // Only logged.
        install(-1);
    }

    #[test]
    fn uncatchable_signal_fails_to_install() {
        assert!(matches!(
            try_install(libc::SIGKILL),
            Err(Error::Install {
                signal: libc::SIGKILL,
                ..
            })
        ));
    }

    /// Swaps in the default disposition and returns what was installed.
    fn take_action(signal: Signal) -> SigAction {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(signal, &default) }.expect("query disposition")
    }

    #[test]
    #[serial]
    fn installs_resetting_nodefer_handler() {
        try_install(libc::SIGUSR2).expect("install");
        let action = take_action(Signal::SIGUSR2);
        assert!(action.flags().contains(SaFlags::SA_NODEFER));
        assert!(action.flags().contains(SaFlags::SA_RESETHAND));
        match action.handler() {
            SigHandler::Handler(handler) => assert_eq!(
                handler as *const () as usize,
                handle_fault as *const () as usize
            ),
            _ => panic!("expected a plain handler"),
        }
    }

    #[test]
    #[serial]
    fn installing_twice_keeps_the_handler() {
        install(libc::SIGUSR2);
        install(libc::SIGUSR2);
        let action = take_action(Signal::SIGUSR2);
        assert!(matches!(action.handler(), SigHandler::Handler(_)));
    }
}
