// Installs the crash handler, then either prints a trace of the current thread or crashes.
//
//   cargo run --example crash -- print
//   cargo run --example crash -- crash

use std::thread;

#[inline(never)]
fn deep(depth: u32, crash: bool) {
    if depth > 0 {
        deep(depth - 1, crash);
        return;
    }
    if crash {
        println!("Raising signal {}", faultline::DEFAULT_SIGNAL);
        unsafe {
            libc::raise(faultline::DEFAULT_SIGNAL);
            // Back from the handler, which reset the disposition. This one terminates.
            libc::raise(faultline::DEFAULT_SIGNAL);
        }
    } else {
        #[allow(deprecated)]
        faultline::print();
    }
}

fn main() {
    if let Err(err) = faultline::try_install(faultline::DEFAULT_SIGNAL) {
        eprintln!("{}", err);
        std::process::exit(1);
    }

    let crash = match std::env::args().nth(1).as_deref() {
        Some("crash") => true,
        Some("print") | None => false,
        Some(other) => {
            eprintln!("usage: crash [print|crash], not {:?}", other);
            std::process::exit(2);
        }
    };

    // Off the main thread, to show the handler runs on whichever thread faulted.
    thread::Builder::new()
        .name("worker".to_string())
        .spawn(move || deep(5, crash))
        .expect("spawn worker")
        .join()
        .expect("worker finished");
}
