use std::sync::{Arc, Mutex};

use crate::Result;

/// Initialize logging/tracing for the relay.
///
/// With the `tracing` feature disabled this is a no-op and [`Logger::console`]
/// falls back to bracketed stdout/stderr lines.
pub fn init(service_name: &str) -> Result<()> {
    let _ = service_name;

    #[cfg(feature = "tracing")]
    {
        use tracing_subscriber::{fmt, EnvFilter};

        // Default: info for our crates, warn for everything else.
        // Can be overridden with `RUST_LOG`.
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "warn,relay=info,relay_core=info,relay_telegram=info,{service_name}=info"
            ))
        });

        // A second init (tests, embedding) keeps the first subscriber.
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(true)
            .try_init();
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Destination for `(component, message)` log records.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, component: &str, message: &str);
}

/// Cloneable logging handle passed to every module and core service.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn console() -> Self {
        Self::new(Arc::new(ConsoleSink))
    }

    /// Logger that keeps every record in memory, plus the buffer to inspect it.
    pub fn memory() -> (Self, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (Self::new(sink.clone()), sink)
    }

    pub fn info(&self, component: &str, message: impl AsRef<str>) {
        self.sink.log(Level::Info, component, message.as_ref());
    }

    pub fn warn(&self, component: &str, message: impl AsRef<str>) {
        self.sink.log(Level::Warn, component, message.as_ref());
    }

    pub fn error(&self, component: &str, message: impl AsRef<str>) {
        self.sink.log(Level::Error, component, message.as_ref());
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    #[cfg(feature = "tracing")]
    fn log(&self, level: Level, component: &str, message: &str) {
        match level {
            Level::Info => tracing::info!(component, "{message}"),
            Level::Warn => tracing::warn!(component, "{message}"),
            Level::Error => tracing::error!(component, "{message}"),
        }
    }

    #[cfg(not(feature = "tracing"))]
    fn log(&self, level: Level, component: &str, message: &str) {
        match level {
            Level::Info => println!("[{component}] {message}"),
            Level::Warn | Level::Error => eprintln!("[{component}] {message}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub component: String,
    pub message: String,
}

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Records logged under `component`.
    pub fn for_component(&self, component: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.component == component)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: Level, component: &str, message: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push(LogRecord {
                level,
                component: component.to_string(),
                message: message.to_string(),
            });
        }
    }
}
