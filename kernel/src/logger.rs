//! Serial kernel logger.

use core::fmt::{Display, Write};

use log::{Level, LevelFilter, Log};
use owo_colors::OwoColorize;
use unicode_segmentation::UnicodeSegmentation;

use crate::hal::i686::serial::SERIAL;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

fn write_colored(writer: &mut impl Write, level: Level, text: impl Display) {
    let _ = match level {
        Level::Error => write!(writer, "{}", text.bright_red()),
        Level::Warn => write!(writer, "{}", text.bright_yellow()),
        Level::Info => write!(writer, "{}", text.bright_blue()),
        Level::Debug => write!(writer, "{}", text.bright_cyan()),
        Level::Trace => write!(writer, "{}", text.bright_magenta()),
    };
}

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut serial = SERIAL.lock();
        let mut writer = WriterWithCr {
            writer: &mut *serial,
        };
        write_colored(
            &mut writer,
            record.level(),
            format_args!("{:5} ", record.level()),
        );
        let _ = write!(
            writer,
            "{}",
            format_args!("[{}] ", crate::hal::current_cpu()).dimmed()
        );
        let _ = writeln!(writer, "{}", record.args());
    }

    fn flush(&self) {}
}

pub fn init() -> Result<(), log::SetLoggerError> {
    crate::hal::i686::serial::init();
    log::set_max_level(LevelFilter::Info);
    log::set_logger(&LOGGER)
}

/// Serial consoles want `\r\n`.
struct WriterWithCr<T> {
    writer: T,
}

impl<T: Write> Write for WriterWithCr<T> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for grapheme in s.graphemes(true) {
            match grapheme {
                "\n" => self.writer.write_str("\r\n")?,
                other => self.writer.write_str(other)?,
            }
        }
        Ok(())
    }
}
