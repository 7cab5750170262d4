//! Worker Loop
//!
//! Polls the working directory for batch input files and answers each one
//! with an output file, until an exit condition is met.
//!
//! # Algorithm
//! ```text
//! WaitForInput -> (Poll)* -> Process -> Consume -> Reply -> WaitForInput
//! ```
//! 1. **WaitForInput**: try to read `<workingDir>/<inputFile>`.
//! 2. **Poll**: input not there yet. Sleep and check the exit conditions.
//! 3. **Process**: run the batch through the dispatcher.
//! 4. **Consume**: delete the input file, with retries.
//! 5. **Reply**: write `<workingDir>/<outputFile>`.
//!
//! The output file is only written once the input file is gone.
//!
//! # Exit conditions
//! Checked after every failed poll, in this order:
//! 1. Input file name without `"Only"`: the worker serves a single batch.
//! 2. Parent process gone (unless the parent pid is 0 or a debugger is
//!    attached). Fatal if an input file is still waiting.
//! 3. No input for longer than the idle timeout.

use scw_core::error::{Result, WorkerError};
use scw_core::{process_batch, WorkerContext};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Marker in the input file name of long-lived workers.
const PERSISTENT_WORKER_MARKER: &str = "Only";

/// Command line of one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub working_dir: PathBuf,
    /// 0 when the worker was not started by an engine process.
    pub parent_pid: u32,
    /// Cosmetic; the parent uses it to tell workers apart.
    pub thread_id: String,
    pub input_file: String,
    pub output_file: String,
}

impl WorkerArgs {
    pub fn input_path(&self) -> PathBuf {
        self.working_dir.join(&self.input_file)
    }

    pub fn output_path(&self) -> PathBuf {
        self.working_dir.join(&self.output_file)
    }

    /// Whether the worker stays alive after its first batch.
    pub fn is_persistent(&self) -> bool {
        self.input_file.contains(PERSISTENT_WORKER_MARKER)
    }
}

/// Clock, sleeping and process queries used by the loop.
pub trait Host {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
    fn is_debugger_present(&self) -> bool;
    fn is_process_running(&self, pid: u32) -> bool;
}

/// The real operating system.
pub struct SystemHost;

impl Host for SystemHost {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn is_debugger_present(&self) -> bool {
        crate::platform::is_debugger_present()
    }

    fn is_process_running(&self, pid: u32) -> bool {
        crate::platform::is_process_running(pid)
    }
}

impl<H: Host + ?Sized> Host for &H {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }

    fn is_debugger_present(&self) -> bool {
        (**self).is_debugger_present()
    }

    fn is_process_running(&self, pid: u32) -> bool {
        (**self).is_process_running(pid)
    }
}

/// Why the worker stopped cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Single-batch worker with nothing left to do.
    BatchServed,
    ParentExited,
    IdleTimeout,
}

enum Poll {
    Input(Vec<u8>),
    Exit(ExitReason),
}

pub struct Worker<H: Host> {
    args: WorkerArgs,
    context: WorkerContext,
    host: H,
    last_compile_time: Instant,
    batches_served: u32,
}

impl<H: Host> Worker<H> {
    pub fn new(args: WorkerArgs, context: WorkerContext, host: H) -> Self {
        let last_compile_time: Instant = host.now();
        Self {
            args,
            context,
            host,
            last_compile_time,
            batches_served: 0,
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn batches_served(&self) -> u32 {
        self.batches_served
    }

    /// Serve batches until an exit condition is met.
    ///
    /// # Returns
    /// * `Ok(reason)` - clean shutdown
    /// * `Err(error)` - fatal error; the caller reports it with the job id in
    ///   [`WorkerContext::job_in_flight`]
    pub fn run(&mut self) -> Result<ExitReason> {
        loop {
            let input: Vec<u8> = match self.wait_for_input()? {
                Poll::Input(input) => input,
                Poll::Exit(reason) => {
                    log::info!("Worker exiting: {:?}", reason);
                    return Ok(reason);
                }
            };

            let output: Vec<u8> = process_batch(&input, &mut self.context)?;
            self.consume_input()?;
            self.reply(&output)?;
            self.batches_served += 1;
        }
    }

    fn wait_for_input(&mut self) -> Result<Poll> {
        let path: PathBuf = self.args.input_path();
        let mut open_failures: u32 = 0;
        loop {
            match std::fs::read(&path) {
                Ok(input) => {
                    self.last_compile_time = self.host.now();
                    log::debug!("Read {} bytes from {}", input.len(), path.display());
                    return Ok(Poll::Input(input));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    // The parent may still be writing the file.
                    open_failures += 1;
                    if open_failures >= self.context.config.file_retry_count {
                        return Err(WorkerError::io(
                            format!("Couldn't open input file {}", path.display()),
                            e,
                        ));
                    }
                    log::debug!("Input file {} not readable yet: {}", path.display(), e);
                }
            }

            self.host.sleep(self.context.config.input_poll_interval());
            if let Some(reason) = self.check_exit()? {
                return Ok(Poll::Exit(reason));
            }
        }
    }

    /// Evaluate the exit conditions after a poll found no input.
    pub fn check_exit(&self) -> Result<Option<ExitReason>> {
        if !self.args.is_persistent() {
            return Ok(Some(ExitReason::BatchServed));
        }

        let parent_pid: u32 = self.args.parent_pid;
        if parent_pid != 0 && !self.host.is_debugger_present() && !self.host.is_process_running(parent_pid) {
            let input = self.args.input_path();
            if input.exists() {
                return Err(WorkerError::io_message(format!(
                    "Parent process {} exited while {} was still waiting",
                    parent_pid,
                    input.display()
                )));
            }
            return Ok(Some(ExitReason::ParentExited));
        }

        let idle: Duration = self.host.now().saturating_duration_since(self.last_compile_time);
        if idle > self.context.config.idle_timeout() {
            return Ok(Some(ExitReason::IdleTimeout));
        }
        Ok(None)
    }

    fn consume_input(&self) -> Result<()> {
        let path: PathBuf = self.args.input_path();
        let attempts: u32 = self.context.config.delete_retry_count;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let e: std::io::Error = match std::fs::remove_file(&path) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            log::debug!("Delete of {} failed (attempt {}): {}", path.display(), attempt, e);
            self.host.sleep(self.context.config.delete_retry_interval());
            if attempt >= attempts {
                let hint: &str = if crate::platform::is_sharing_violation(&e) {
                    "is it opened by another process?"
                } else {
                    "is it readonly?"
                };
                return Err(WorkerError::io(
                    format!("Couldn't delete input file {}, {}", path.display(), hint),
                    e,
                ));
            }
        }
    }

    fn reply(&self, output: &[u8]) -> Result<()> {
        let path: PathBuf = self.args.output_path();
        std::fs::write(&path, output)
            .map_err(|e| WorkerError::io(format!("Couldn't write output file {}", path.display()), e))?;
        log::info!("Wrote {} bytes to {}", output.len(), path.display());
        Ok(())
    }
}
