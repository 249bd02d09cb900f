//! Kernel diagnostics.
//!
//! `kprintln!` goes to whatever sink the boot code registered; under the
//! host test harness nothing is registered and messages are dropped. A
//! sink is a plain fn so logging never allocates and stays usable from
//! signal paths.

use core::fmt::{self, Write};

use spin::Mutex;

static SINK: Mutex<Option<fn(&str)>> = Mutex::new(None);

/// Install the console sink. Called once at boot.
pub fn set_sink(sink: fn(&str)) {
    *SINK.lock() = Some(sink);
}

cfg_if::cfg_if! {
    if #[cfg(test)] {
        // The host harness mirrors diagnostics to stderr.
        fn fallback(s: &str) {
            std::eprint!("{}", s);
        }
    } else {
        fn fallback(_s: &str) {}
    }
}

struct Printer;

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match *SINK.lock() {
            Some(sink) => sink(s),
            None => fallback(s),
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    // Formatting into a sink-less printer is a no-op.
    let _ = Printer.write_fmt(args);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::klog::_print(core::format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ({
        $crate::klog::_print(core::format_args!($($arg)*));
        $crate::kprint!("\n");
    });
}
