//! Serial port output and the kernel logger
//!
//! Outputs to COM1 (0x3F8) for the QEMU serial console. The `log` facade
//! is routed here by [`init_logger`]; `serial_print!`/`serial_println!`
//! write directly and are used on the fatal path.
//!
//! Host builds have no UART: test builds print to stderr, other builds
//! discard the output.

use core::fmt;

/// COM1 port address
#[cfg(target_os = "none")]
const COM1: u16 = 0x3F8;

#[cfg(target_os = "none")]
mod uart {
    use core::fmt::{self, Write};
    use spin::Mutex;
    use x86_64::instructions::port::Port;

    use super::COM1;

    /// Serial port writer
    pub struct SerialWriter {
        data: Port<u8>,
        line_status: Port<u8>,
    }

    impl SerialWriter {
        const fn new() -> Self {
            Self {
                data: Port::new(COM1),
                line_status: Port::new(COM1 + 5),
            }
        }

        fn write_byte(&mut self, byte: u8) {
            // SAFETY: COM1 is set up by the boot loader
            unsafe {
                // Wait for transmit buffer to be empty
                while self.line_status.read() & 0x20 == 0 {
                    core::hint::spin_loop();
                }
                self.data.write(byte);
            }
        }
    }

    impl Write for SerialWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                if byte == b'\n' {
                    self.write_byte(b'\r');
                }
                self.write_byte(byte);
            }
            Ok(())
        }
    }

    /// Global serial writer (already initialized by bootloader)
    pub static WRITER: Mutex<SerialWriter> = Mutex::new(SerialWriter::new());
}

/// Print to serial port
#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // A CPU that panicked mid-print must still be able to report.
    if crate::ke::KERNEL.is_panicking() && uart::WRITER.is_locked() {
        // SAFETY: all other CPUs stop at their next trap once panicking
        unsafe { uart::WRITER.force_unlock() };
    }
    let _ = uart::WRITER.lock().write_fmt(args);
}

#[cfg(all(not(target_os = "none"), test))]
pub fn _print(args: fmt::Arguments) {
    std::eprint!("{}", args);
}

#[cfg(all(not(target_os = "none"), not(test)))]
pub fn _print(_args: fmt::Arguments) {}

/// Print macro for serial output
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

/// Print with newline macro for serial output
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

/// `log` backend writing `[LEVEL target] message` lines to the serial port
pub struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            _print(format_args!(
                "[{:<5} {}] {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the serial logger
///
/// Debug builds log at `Debug`, release builds at `Info`.
pub fn init_logger() {
    // Fails only if a logger is already installed, which is fine.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
}
