//! Fatal Error Channel
//!
//! Everything that ends the worker abnormally goes through here: protocol
//! and I/O errors returned by the loop, and panics that escape it. The
//! channel writes the error record to the output file the parent is polling
//! for, then exits with a nonzero status. It does not need the logger.

use scw_core::compiler::panic_message;
use scw_core::protocol::batch::encode_error_record;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Exit status after a fatal error.
pub const FATAL_EXIT_CODE: i32 = 1;

/// Location of the most recent panic, captured by [`install_panic_hook`].
static LAST_PANIC_LOCATION: Mutex<Option<String>> = Mutex::new(None);

pub struct FatalChannel {
    output_path: PathBuf,
    exit_delay: Duration,
}

impl FatalChannel {
    pub fn new(output_path: impl Into<PathBuf>, exit_delay: Duration) -> Self {
        Self {
            output_path: output_path.into(),
            exit_delay,
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Write the error record for `job_id` to the output file.
    pub fn write_record(&self, job_id: i32, message: &str) -> std::io::Result<()> {
        std::fs::write(&self.output_path, encode_error_record(job_id, message))
    }

    /// Report `message` to the parent and exit.
    ///
    /// With a debugger attached the worker stops in it instead of writing the
    /// record, so the failing state can be inspected.
    pub fn report(&self, job_id: i32, message: &str) -> ! {
        log::error!("Fatal error in job {}: {}", job_id, message);
        if crate::platform::is_debugger_present() {
            crate::platform::debug_break();
        } else if let Err(e) = self.write_record(job_id, message) {
            log::error!("Couldn't write error record to {}: {}", self.output_path.display(), e);
        }
        log::logger().flush();
        std::thread::sleep(self.exit_delay);
        std::process::exit(FATAL_EXIT_CODE);
    }
}

/// Record panic locations and log panics before unwinding starts.
///
/// The previous hook still runs so the panic also reaches stderr.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let location: String = info
            .location()
            .map(|location| format!("{}:{}:{}", location.file(), location.line(), location.column()))
            .unwrap_or_else(|| "<unknown>".to_string());
        log::error!("Panic at {}: {}", location, panic_message(info.payload()));
        if let Ok(mut last) = LAST_PANIC_LOCATION.lock() {
            *last = Some(location);
        }
        previous(info);
    }));
}

/// Message for a panic that escaped the worker loop.
pub fn crash_message(payload: &(dyn std::any::Any + Send)) -> String {
    let location: Option<String> = LAST_PANIC_LOCATION
        .lock()
        .ok()
        .and_then(|mut last| last.take());
    match location {
        Some(location) => format!("WorkerCrash at {}: {}", location, panic_message(payload)),
        None => format!("WorkerCrash: {}", panic_message(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scw_core::protocol::batch::decode_error_record;

    #[test]
    fn test_write_record() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FatalChannel::new(dir.path().join("WorkerOutputOnly.out"), Duration::ZERO);
        channel.write_record(42, "Couldn't delete input file").unwrap();

        let data = std::fs::read(channel.output_path()).unwrap();
        let (job_id, message) = decode_error_record(&data).unwrap().unwrap();
        assert_eq!(job_id, 42);
        assert_eq!(message, "Couldn't delete input file");
    }

    #[test]
    fn test_crash_message_from_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("index out of bounds"));
        let message = crash_message(&*payload);
        assert!(message.starts_with("WorkerCrash"));
        assert!(message.ends_with("index out of bounds"));

        let payload: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert!(crash_message(&*payload).contains("unknown exception"));
    }
}
