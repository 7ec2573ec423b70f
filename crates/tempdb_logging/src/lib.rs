//! Logging setup for the tempdb binary and test suites.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "tempdb=info,tempdb_cli=info";
const VERBOSE_LOG_FILTER: &str = "tempdb=debug,tempdb_cli=debug";
const HOME_ENV: &str = "TEMPDB_HOME";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for a binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Debug output on stderr, including server output lines
    pub verbose: bool,
    /// Also write to a size-rotated file under [`logs_dir`]
    pub log_to_file: bool,
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber: stderr always, a rolling file optionally.
///
/// `RUST_LOG` overrides the default filter; `verbose` forces debug level on
/// stderr.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let console_filter = if config.verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        env_filter(DEFAULT_LOG_FILTER)
    };
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file = if config.log_to_file {
        let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
        let writer = SharedRollingWriter::new(log_dir, config.app_name)
            .context("Failed to initialize rolling log writer")?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(DEFAULT_LOG_FILTER)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(())
}

/// Route logs through the test harness's captured output. Safe to call
/// from every test; only the first call installs anything.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("tempdb=debug"))
        .with_test_writer()
        .try_init();
}

/// Home directory for tempdb state: `$TEMPDB_HOME`, else `~/.tempdb`.
pub fn tempdb_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(HOME_ENV) {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".tempdb"))
}

/// Logs directory: `<tempdb home>/logs`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(tempdb_home()?.join("logs"))
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir()?;
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

struct RollingFileAppender {
    dir: PathBuf,
    base_name: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    current_size: u64,
}

impl RollingFileAppender {
    fn new(dir: PathBuf, base_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut appender = Self {
            dir,
            base_name: sanitize_name(base_name),
            max_files: max_files.max(1),
            max_size,
            file: None,
            current_size: 0,
        };
        appender.reopen()?;
        if appender.current_size > appender.max_size {
            appender.rotate()?;
        }
        Ok(appender)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        self.current_size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, index))
    }

    /// Shift `name.log.N` to `N+1`, drop the oldest, reopen a fresh file.
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let max_index = self.max_files - 1;
        if max_index > 0 {
            let oldest = self.rotated_path(max_index);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for idx in (1..max_index).rev() {
                let src = self.rotated_path(idx);
                if src.exists() {
                    fs::rename(&src, self.rotated_path(idx + 1))?;
                }
            }
            let current = self.current_path();
            if current.exists() {
                fs::rename(current, self.rotated_path(1))?;
            }
        } else {
            // Single file: truncate in place
            File::create(self.current_path())?;
        }

        self.reopen()
    }
}

impl Write for RollingFileAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let bytes = file.write(buf)?;
        self.current_size += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// `MakeWriter` over one appender shared by every event.
#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RollingFileAppender>>,
}

impl SharedRollingWriter {
    fn new(dir: PathBuf, base_name: &str) -> Result<Self> {
        let appender = RollingFileAppender::new(dir, base_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(appender)),
        })
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("tempdb"), "tempdb");
        assert_eq!(sanitize_name("tempdb cli/run"), "tempdb_cli_run");
        assert_eq!(sanitize_name("a.b"), "a_b");
    }

    #[test]
    fn test_appender_rotates_by_size() {
        let tmp = TempDir::new().unwrap();
        let mut appender =
            RollingFileAppender::new(tmp.path().to_path_buf(), "tempdb", 3, 16).unwrap();

        for _ in 0..4 {
            appender.write_all(b"0123456789abcdef").unwrap();
        }
        appender.flush().unwrap();

        assert!(tmp.path().join("tempdb.log").exists());
        assert!(tmp.path().join("tempdb.log.1").exists());
        assert!(tmp.path().join("tempdb.log.2").exists());
        // Capped at max_files
        assert!(!tmp.path().join("tempdb.log.3").exists());
        assert_eq!(fs::read(tmp.path().join("tempdb.log")).unwrap().len(), 16);
    }

    #[test]
    fn test_appender_appends_to_existing_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("tempdb.log"), b"old\n").unwrap();

        let mut appender =
            RollingFileAppender::new(tmp.path().to_path_buf(), "tempdb", 2, 1024).unwrap();
        appender.write_all(b"new\n").unwrap();
        appender.flush().unwrap();

        let content = fs::read_to_string(tmp.path().join("tempdb.log")).unwrap();
        assert_eq!(content, "old\nnew\n");
    }

    #[test]
    fn test_single_file_truncates() {
        let tmp = TempDir::new().unwrap();
        let mut appender =
            RollingFileAppender::new(tmp.path().to_path_buf(), "tempdb", 1, 8).unwrap();
        appender.write_all(b"12345678").unwrap();
        appender.write_all(b"abcd").unwrap();
        appender.flush().unwrap();

        let content = fs::read_to_string(tmp.path().join("tempdb.log")).unwrap();
        assert_eq!(content, "abcd");
        assert!(!tmp.path().join("tempdb.log.1").exists());
    }

    #[test]
    fn test_shared_writer_feeds_file_layer() {
        use tracing_subscriber::fmt::MakeWriter;

        let tmp = TempDir::new().unwrap();
        let writer = SharedRollingWriter::new(tmp.path().to_path_buf(), "tempdb cli").unwrap();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer.clone())
                .with_ansi(false),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("server ready");
        });
        writer.make_writer().flush().unwrap();

        let content = fs::read_to_string(tmp.path().join("tempdb_cli.log")).unwrap();
        assert!(content.contains("server ready"));
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::info!("logging initialized twice");
    }
}
