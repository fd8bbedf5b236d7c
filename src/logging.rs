use core::{fmt, fmt::Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::RwLock;

/// somewhere debug output can go (serial port, emulator console, a buffer in tests...)
///
/// implementations should be callable from inside exception handlers, so no blocking
pub trait DebugSink: Send + Sync {
    fn puts(&self, s: &str);
}

/// wrapper struct to allow us to write!() to a sink
struct SinkWriter<'a>(&'a dyn DebugSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.puts(s);
        Ok(())
    }
}

/// simple logger implementation over whatever sink is currently selected
pub struct Logger {
    sink: RwLock<Option<&'static dyn DebugSink>>,
    max_level: RwLock<LevelFilter>,
}

impl Logger {
    pub const fn new() -> Self {
        Self {
            sink: RwLock::new(None),
            max_level: RwLock::new(LevelFilter::Info),
        }
    }

    /// selects where log output goes from now on
    pub fn set_sink(&self, sink: &'static dyn DebugSink) {
        *self.sink.write() = Some(sink);
    }

    pub fn set_max_level(&self, level: LevelFilter) {
        *self.max_level.write() = level;
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match self.max_level.try_read() {
            Some(max_level) => metadata.level() <= *max_level,
            None => true,
        }
    }

    #[allow(unused_must_use)]
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // sink is being swapped out, drop the line instead of spinning
        let sink = match self.sink.try_read() {
            Some(sink) => match *sink {
                Some(sink) => sink,
                None => return,
            },
            None => return,
        };

        let level = record.level();
        let width = 5;
        let args = record.args();

        if let Some(path) = record.module_path() {
            writeln!(&mut SinkWriter(sink), "{level:width$} [{path}] {args}");
        } else {
            writeln!(&mut SinkWriter(sink), "{level:width$} [unknown] {args}");
        }
    }

    fn flush(&self) {}
}

/// our logger that we will log things with
static LOGGER: Logger = Logger::new();

/// initialize the logger, setting the sink and max level in the process
pub fn init(sink: &'static dyn DebugSink, max_level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.set_sink(sink);
    LOGGER.set_max_level(max_level);
    log::set_logger(&LOGGER).map(|_| log::set_max_level(max_level))
}

/// switches the global logger over to a different sink
pub fn set_sink(sink: &'static dyn DebugSink) {
    LOGGER.set_sink(sink);
}
