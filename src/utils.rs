use anyhow::Result;
use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;

// Logging setup for the chatsync binary

/// Line logger tagging each record with the sync component that emitted it
pub struct SyncLogger {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl SyncLogger {
    /// Log to `log_file_path` (appending) or to stdout
    pub fn new(log_file_path: Option<&str>) -> Result<Self> {
        let sink: Box<dyn Write + Send> = match log_file_path {
            Some(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
            None => Box::new(io::stdout()),
        };
        Ok(SyncLogger { sink: Mutex::new(sink) })
    }
}

/// `chatsync::sync::presence` -> `presence`
fn component(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

impl Log for SyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] {:<5} {:<14} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            component(record.target()),
            record.args()
        );
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = sink.write_all(line.as_bytes());
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}

pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    let logger = SyncLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_is_last_target_segment() {
        assert_eq!(component("chatsync::sync::presence"), "presence");
        assert_eq!(component("chatsync"), "chatsync");
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.log");
        let logger = SyncLogger::new(path.to_str()).unwrap();
        log::set_max_level(LevelFilter::Info);
        logger.log(
            &Record::builder()
                .args(format_args!("heartbeat sent"))
                .level(log::Level::Info)
                .target("chatsync::sync::presence")
                .build(),
        );
        logger.flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("presence"));
        assert!(written.ends_with("heartbeat sent\n"));
    }
}
