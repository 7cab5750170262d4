//! Worker Logger
//!
//! `log` backend for the worker process. Every record goes to an
//! `env_logger` stderr logger filtered by `RUST_LOG`. Workers started for
//! local jobs (input file name containing `"Only"`) also append
//! informational records to `WorkerLog.txt` in the working directory.
//!
//! # File format
//! UTF-16LE with a byte order mark, one `\r\n` terminated line per record,
//! flushed after every line so the file survives a crash.

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use scw_core::WorkerConfig;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub const LOG_FILE_NAME: &str = "WorkerLog.txt";

/// Most verbose level written to the log file.
const FILE_LEVEL: Level = Level::Info;

/// Marker in the input file name of workers serving the local machine.
const LOCAL_WORKER_MARKER: &str = "Only";

/// Whether a worker reading `input_file` keeps a log file.
pub fn log_file_enabled(input_file: &str) -> bool {
    input_file.contains(LOCAL_WORKER_MARKER)
}

pub struct LogFile {
    file: File,
}

impl LogFile {
    /// Create the log file, retrying while another worker still holds it.
    pub fn open(path: &Path, attempts: u32, interval: Duration) -> io::Result<Self> {
        let mut attempt: u32 = 1;
        loop {
            match File::create(path) {
                Ok(mut file) => {
                    file.write_all(&0xFEFFu16.to_le_bytes())?;
                    return Ok(Self { file });
                }
                Err(_) if attempt < attempts => {
                    attempt += 1;
                    std::thread::sleep(interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut bytes: Vec<u8> = Vec::with_capacity((line.len() + 2) * 2);
        for unit in line.encode_utf16().chain("\r\n".encode_utf16()) {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        self.file.write_all(&bytes)?;
        self.file.flush()
    }
}

pub struct WorkerLogger {
    console: env_logger::Logger,
    file: Option<Mutex<LogFile>>,
    mirror_to_debugger: bool,
}

impl WorkerLogger {
    pub fn new(console: env_logger::Logger, file: Option<LogFile>, mirror_to_debugger: bool) -> Self {
        Self {
            console,
            file: file.map(Mutex::new),
            mirror_to_debugger,
        }
    }

    /// Most verbose level any sink accepts.
    pub fn max_level(&self) -> LevelFilter {
        let file_level: LevelFilter = if self.file.is_some() || self.mirror_to_debugger {
            FILE_LEVEL.to_level_filter()
        } else {
            LevelFilter::Off
        };
        self.console.filter().max(file_level)
    }

    fn wants_line(&self, level: Level) -> bool {
        (self.file.is_some() || self.mirror_to_debugger) && level <= FILE_LEVEL
    }
}

fn format_line(record: &Record<'_>) -> String {
    format!(
        "[{}] {}: {}",
        chrono::Local::now().format("%Y.%m.%d-%H.%M.%S%.3f"),
        record.level(),
        record.args()
    )
}

impl Log for WorkerLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.console.enabled(metadata) || self.wants_line(metadata.level())
    }

    fn log(&self, record: &Record<'_>) {
        if self.console.matches(record) {
            self.console.log(record);
        }
        if !self.wants_line(record.level()) {
            return;
        }

        let line: String = format_line(record);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                // Nowhere left to report a failing log write.
                let _ = file.write_line(&line);
            }
        }
        if self.mirror_to_debugger {
            crate::platform::output_debug_string(&line);
        }
    }

    fn flush(&self) {
        self.console.flush();
    }
}

/// Install the worker logger as the global `log` backend.
pub fn init(working_dir: &Path, input_file: &str, config: &WorkerConfig) -> Result<()> {
    let console: env_logger::Logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).build();

    let path = working_dir.join(LOG_FILE_NAME);
    let opened: Option<io::Result<LogFile>> = log_file_enabled(input_file)
        .then(|| LogFile::open(&path, config.file_retry_count, config.file_retry_interval()));
    let (file, open_error): (Option<LogFile>, Option<io::Error>) = match opened {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    let logger = WorkerLogger::new(console, file, crate::platform::is_debugger_present());
    let max_level: LevelFilter = logger.max_level();
    log::set_boxed_logger(Box::new(logger)).context("Failed to install logger")?;
    log::set_max_level(max_level);

    if let Some(e) = open_error {
        log::warn!("Couldn't open log file {}: {}", path.display(), e);
    }
    Ok(())
}
