use anyhow::{Context, Result};
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

/// Environment variable consulted when no level flag is given
pub const LOG_LEVEL_ENV: &str = "TREEFETCH_LOG";

enum Sink {
    Stderr,
    File(Mutex<File>),
}

/// `log` backend writing timestamped lines to stderr or an append-only file
pub struct Logger {
    level: Level,
    sink: Sink,
}

impl Logger {
    pub fn stderr(level: Level) -> Self {
        Self {
            level,
            sink: Sink::Stderr,
        }
    }

    pub fn file<P: AsRef<Path>>(path: P, level: Level) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("open log file {}", path.as_ref().display()))?;
        Ok(Self {
            level,
            sink: Sink::File(Mutex::new(f)),
        })
    }

    fn format(record: &Record<'_>) -> String {
        format!(
            "{} {} [{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format(record);
        match &self.sink {
            Sink::Stderr => eprintln!("{line}"),
            Sink::File(f) => {
                if let Ok(mut f) = f.lock() {
                    let _ = writeln!(f, "{line}");
                }
            }
        }
    }

    fn flush(&self) {
        if let Sink::File(f) = &self.sink {
            if let Ok(mut f) = f.lock() {
                let _ = f.flush();
            }
        }
    }
}

/// Pick the level: explicit flag, then environment, then `default`.
/// Unparseable or `off` values fall through to the next source.
pub fn resolve_level(flag: Option<&str>, env: Option<&str>, default: Level) -> Level {
    let parse = |s: &str| s.parse::<LevelFilter>().ok().and_then(|f| f.to_level());
    flag.and_then(parse)
        .or_else(|| env.and_then(parse))
        .unwrap_or(default)
}

/// Install the process-wide logger once; later calls are no-ops
pub fn init(flag: Option<&str>, log_file: Option<&Path>, default: Level) -> Result<()> {
    static LOGGER: OnceLock<Logger> = OnceLock::new();
    if LOGGER.get().is_some() {
        return Ok(());
    }

    let env = std::env::var(LOG_LEVEL_ENV).ok();
    let level = resolve_level(flag, env.as_deref(), default);
    let logger = match log_file {
        Some(p) => Logger::file(p, level)?,
        None => Logger::stderr(level),
    };
    let logger = LOGGER.get_or_init(|| logger);
    log::set_logger(logger).map_err(|e| anyhow::anyhow!("install logger: {e}"))?;
    log::set_max_level(level.to_level_filter());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_precedence() {
        assert_eq!(resolve_level(Some("debug"), Some("error"), Level::Warn), Level::Debug);
        assert_eq!(resolve_level(None, Some("ERROR"), Level::Warn), Level::Error);
        assert_eq!(resolve_level(Some("garbage"), None, Level::Info), Level::Info);
        assert_eq!(resolve_level(Some("off"), Some("trace"), Level::Info), Level::Trace);
        assert_eq!(resolve_level(None, None, Level::Warn), Level::Warn);
    }

    #[test]
    fn enabled_respects_threshold() {
        let logger = Logger::stderr(Level::Info);
        let info = Metadata::builder().level(Level::Info).build();
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(logger.enabled(&info));
        assert!(!logger.enabled(&debug));
    }

    #[test]
    fn file_sink_appends_formatted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/daemon.log");
        let logger = Logger::file(&path, Level::Info).unwrap();
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("treefetch::server")
                .args(format_args!("session opened"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("treefetch::server")
                .args(format_args!("filtered out"))
                .build(),
        );
        logger.flush();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("INFO [treefetch::server] session opened"));
    }
}
