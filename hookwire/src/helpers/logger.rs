use std::{
    env,
    io::{stderr, IsTerminal, Write},
    sync::{Mutex, PoisonError},
    thread,
};

use anyhow::Result;
use log::{Level, LevelFilter, Metadata, Record};
use termcolor::{BufferedStandardStream, Color, ColorChoice, ColorSpec, WriteColor};
use time::{macros::format_description, OffsetDateTime};

/// Our own logger implementation, to handle log:: messages. Everything goes
/// to stderr, stdout being reserved to the log sink.
pub(crate) struct Logger {
    /// Max level the logger will output.
    max_level: LevelFilter,
    inner: Mutex<LoggerWriter>,
}

struct LoggerWriter {
    stderr: BufferedStandardStream,
    use_colors: bool,
}

impl LoggerWriter {
    fn set_color(&mut self, level: Level) -> Result<()> {
        if !self.use_colors {
            return Ok(());
        }

        let color = match level {
            Level::Error => Color::Red,
            Level::Warn => Color::Yellow,
            Level::Info => Color::Blue,
            Level::Debug => Color::Cyan,
            Level::Trace => Color::White,
        };
        self.stderr.set_color(ColorSpec::new().set_fg(Some(color)))?;
        Ok(())
    }

    fn reset_color(&mut self) -> Result<()> {
        if self.use_colors {
            self.stderr.reset()?;
        }
        Ok(())
    }
}

impl Logger {
    pub(crate) fn init(max_level: LevelFilter) -> Result<()> {
        let logger = Logger {
            max_level,
            inner: Mutex::new(LoggerWriter {
                stderr: BufferedStandardStream::stderr(ColorChoice::Auto),
                use_colors: Self::use_colors(),
            }),
        };

        log::set_max_level(max_level);
        log::set_boxed_logger(Box::new(logger))?;
        Ok(())
    }

    fn try_log(&self, record: &Record) -> Result<()> {
        let verbose = self.max_level >= LevelFilter::Debug;
        let inner: &mut LoggerWriter = &mut self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        // When debugging, show the time and the emitting thread as events
        // flow through multiple threads.
        if verbose {
            OffsetDateTime::now_utc().format_into(
                &mut inner.stderr,
                format_description!("[hour]:[minute]:[second].[subsecond digits:6] "),
            )?;
        }

        if record.level() <= Level::Warn || verbose {
            inner.set_color(record.level())?;
            write!(inner.stderr, "{:5} ", record.level())?;
            inner.reset_color()?;
        }

        if verbose {
            write!(
                inner.stderr,
                "[{}] ",
                thread::current().name().unwrap_or("unnamed")
            )?;
        }

        writeln!(inner.stderr, "{}", record.args())?;
        inner.stderr.flush()?;
        Ok(())
    }

    /// Check if colors can be used in the output.
    fn use_colors() -> bool {
        stderr().is_terminal() && matches!(env::var("TERM"), Ok(x) if x != "dumb")
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Not much we can do to report the error...
        let _ = self.try_log(record);
    }

    fn flush(&self) {
        let _ = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stderr
            .flush();
    }
}
