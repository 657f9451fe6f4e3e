use std::ops::ControlFlow;

/// Where trace lines go.
///
/// Implementations are called from inside a signal handler, so `emit` must not allocate or take
/// locks a faulting thread could be holding. Each call is independent: by the time `emit` returns
/// the text has to be visible, because the process may be killed right afterwards.
pub trait Reporter {
    fn emit(&mut self, text: &[u8]);

    /// Asked after every emitted frame line. `Break` ends the walk early.
    fn after_frame(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Writes straight to file descriptor 2 with `write(2)`.
///
/// There is no userspace buffer involved, so nothing is left to flush.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrReporter;

#[cfg(unix)]
impl Reporter for StderrReporter {
    fn emit(&mut self, text: &[u8]) {
        write_all_raw(libc::STDERR_FILENO, text);
    }
}

#[cfg(not(unix))]
impl Reporter for StderrReporter {
    fn emit(&mut self, text: &[u8]) {
        use std::io::Write;

        let stderr = std::io::stderr();
        let mut stderr = stderr.lock();
        let _ = stderr.write_all(text);
        let _ = stderr.flush();
    }
}

/// Collects everything in memory. Not meant for use inside a handler.
impl Reporter for Vec<u8> {
    fn emit(&mut self, text: &[u8]) {
        self.extend_from_slice(text);
    }
}

/// Loops over partial writes and EINTR. Any other error drops the rest of the text, there is
/// nobody left to tell.
#[cfg(unix)]
fn write_all_raw(fd: libc::c_int, mut text: &[u8]) {
    while !text.is_empty() {
        let written = unsafe { libc::write(fd, text.as_ptr() as *const libc::c_void, text.len()) };
        if written < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        if written == 0 {
            return;
        }
        text = &text[written as usize..];
    }
}
