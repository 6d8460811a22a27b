//! `log` backend for environments, over the console syscall

use core::fmt::{self, Write};

use crate::syscall::{cputs, thisenv};

struct Console;

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        cputs(s);
        Ok(())
    }
}

/// Writes `[LEVEL envid] message` lines to the console
pub struct UserLogger;

impl log::Log for UserLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(Console, "[{:<5} {}] {}", record.level(), thisenv(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: UserLogger = UserLogger;

/// Install the console logger at `level`
pub fn init_logger(level: log::LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
