use crate::config::BridgeConfig;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Keeps the tee target alive for the lifetime of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
    path: Option<PathBuf>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }

    fn with_file(&self, op: impl FnOnce(&mut File) -> io::Result<()>) {
        let Some(file) = &self.file else {
            return;
        };
        if let Ok(mut file) = file.lock() {
            let _ = op(&mut file);
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}

/// Installs the global subscriber. Level precedence: `RUST_LOG`, then
/// `CODOT_LOG_LEVEL`, then `debug` or `info` from the config.
pub fn init_logging(config: &BridgeConfig) -> Option<LogGuard> {
    let fallback = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match std::env::var("CODOT_LOG_LEVEL") {
            Ok(level) if !level.trim().is_empty() => EnvFilter::try_new(level),
            _ => EnvFilter::try_new(fallback),
        })
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    let guard = open_log_file(&config.log_dir, config.port).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        LogGuard {
            file: None,
            path: None,
        }
    });
    let file = guard.file.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(move || MultiWriter::new(file.clone())))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    if let Some(path) = &guard.path {
        info!(event = "log_file_open", path = %path.display());
    }
    Some(guard)
}

fn open_log_file(log_dir: &str, port: u16) -> io::Result<LogGuard> {
    let disabled = LogGuard {
        file: None,
        path: None,
    };
    if log_dir.trim().is_empty() {
        return Ok(disabled);
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(disabled);
    }
    let path = dir.join(format!("codot-bridge-{port}.log"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
        path: Some(path),
    })
}
