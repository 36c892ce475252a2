//! Console-backed `log` sink, standing in for `rumpuser_dprintf`/
//! `rumpuser_putchar`: every record gets formatted and handed to whatever
//! `console_print` function was registered at [`init_logging`] time.

use alloc::string::String;
use core::fmt::Write as _;
use log::{Level, Log, Metadata, Record};
use spin::Mutex;

type ConsoleSink = fn(&[u8]);

static CONSOLE: Mutex<Option<ConsoleSink>> = Mutex::new(None);

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = *CONSOLE.lock() {
            let mut line = String::new();
            let _ = writeln!(line, "[{}] {}", record.level(), record.args());
            sink(line.as_bytes());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger as the `log` crate's global logger.
///
/// `sink` is typically a thin wrapper around a [`crate::hal::Hypervisor`]'s
/// `console_print`. Panics if a logger has already been installed (the
/// `log` crate itself enforces this).
pub fn init_logging(sink: ConsoleSink, max_level: log::LevelFilter) {
    *CONSOLE.lock() = Some(sink);
    log::set_logger(&LOGGER).expect("logger already initialized");
    log::set_max_level(max_level);
}
