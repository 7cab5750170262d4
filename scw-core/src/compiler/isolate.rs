//! Native Fault Scope
//!
//! Compiler and plugin entry points are foreign code. An access violation
//! or abort inside one has to fail the job, not the worker, so every such
//! call runs through [`isolated`]:
//!
//! - Windows: the call runs under a structured exception handler.
//! - Unix: the call runs in a forked child and its result comes back over a
//!   pipe in the [`Transfer`] encoding. A child that dies on a signal, or
//!   exits without a complete result, has faulted.
//!
//! A fault is re-raised in the caller as a [`NativeFault`] unwind, which
//! [`super::guarded`] turns into `None` like any other compiler exception.
//! Panics raised by the call itself keep their payload.

use super::CompileOutput;
use crate::error::{Result, WorkerError};
use crate::protocol::codec::{write_blob, write_value, ByteReader};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Unwind payload for a call that faulted in native code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFault {
    pub call: String,
    pub detail: String,
}

impl fmt::Display for NativeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} faulted: {}", self.call, self.detail)
    }
}

impl std::error::Error for NativeFault {}

/// Values that can be carried out of an isolated call.
pub trait Transfer: Sized {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self>;
}

impl Transfer for () {
    fn encode(&self, _out: &mut Vec<u8>) {}

    fn decode(_reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(())
    }
}

impl Transfer for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        write_value(out, u8::from(*self));
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        reader.read_bool()
    }
}

impl Transfer for i32 {
    fn encode(&self, out: &mut Vec<u8>) {
        write_value(out, *self);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        reader.read_value()
    }
}

impl Transfer for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_blob(out, self);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(reader.read_ansi_bytes()?.to_vec())
    }
}

impl<T: Transfer> Transfer for Option<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Some(value) => {
                write_value(out, 1u8);
                value.encode(out);
            }
            None => write_value(out, 0u8),
        }
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        if reader.read_bool()? {
            Ok(Some(T::decode(reader)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: Transfer, B: Transfer> Transfer for (A, B) {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
        self.1.encode(out);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let first: A = A::decode(reader)?;
        Ok((first, B::decode(reader)?))
    }
}

impl Transfer for CompileOutput {
    fn encode(&self, out: &mut Vec<u8>) {
        self.hresult.encode(out);
        self.bytecode.encode(out);
        self.errors.encode(out);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            hresult: reader.read_value()?,
            bytecode: Vec::decode(reader)?,
            errors: Vec::decode(reader)?,
        })
    }
}

/// Errors keep their kind and message; the location becomes this module.
impl Transfer for WorkerError {
    fn encode(&self, out: &mut Vec<u8>) {
        let kind: u8 = match self {
            WorkerError::Protocol { .. } => 0,
            WorkerError::Io { .. } => 1,
            WorkerError::Plugin { .. } => 2,
            WorkerError::Config { .. } => 3,
        };
        write_value(out, kind);
        write_blob(out, self.message().as_bytes());
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let kind: u8 = reader.read_value()?;
        let message: String = reader.parse_ansi_string()?;
        match kind {
            0 => Ok(WorkerError::protocol(message)),
            1 => Ok(WorkerError::io_message(message)),
            2 => Ok(WorkerError::plugin(message)),
            3 => Ok(WorkerError::config(message)),
            other => Err(WorkerError::protocol(format!("Unknown error kind {} from isolated call", other))),
        }
    }
}

enum Failure {
    Fault(String),
    Panic(Box<dyn Any + Send>),
}

/// Run `call` under the native fault scope.
///
/// # Panics
/// Unwinds with a [`NativeFault`] payload if `call` faulted, or with the
/// original payload if `call` panicked.
pub fn isolated<T: Transfer>(what: &str, call: impl FnOnce() -> T) -> T {
    match run_isolated(call) {
        Ok(value) => value,
        Err(Failure::Fault(detail)) => panic::resume_unwind(Box::new(NativeFault {
            call: what.to_string(),
            detail,
        })),
        Err(Failure::Panic(payload)) => panic::resume_unwind(payload),
    }
}

#[cfg(windows)]
fn run_isolated<T: Transfer>(call: impl FnOnce() -> T) -> std::result::Result<T, Failure> {
    let mut call = Some(call);
    let mut outcome: Option<std::thread::Result<T>> = None;
    // Unwinding must not cross the handler frame.
    microseh::try_seh(|| {
        if let Some(call) = call.take() {
            outcome = Some(panic::catch_unwind(AssertUnwindSafe(call)));
        }
    })
    .map_err(|exception| Failure::Fault(exception.to_string()))?;
    match outcome {
        Some(Ok(value)) => Ok(value),
        Some(Err(payload)) => Err(Failure::Panic(payload)),
        None => Err(Failure::Fault("call did not complete".to_string())),
    }
}

#[cfg(unix)]
fn run_isolated<T: Transfer>(call: impl FnOnce() -> T) -> std::result::Result<T, Failure> {
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::FromRawFd;

    let mut fds: [libc::c_int; 2] = [-1; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Failure::Fault(format!("pipe failed: {}", std::io::Error::last_os_error())));
    }
    let (mut reader, writer): (File, File) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

    let pid: libc::pid_t = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Failure::Fault(format!("fork failed: {}", std::io::Error::last_os_error())));
    }
    if pid == 0 {
        drop(reader);
        child_main(writer, call);
    }
    drop(writer);

    // Drain before reaping; a large result would otherwise block the child.
    let mut bytes: Vec<u8> = Vec::new();
    let read = reader.read_to_end(&mut bytes);
    let status: libc::c_int = reap(pid)?;
    if libc::WIFSIGNALED(status) {
        return Err(Failure::Fault(format!("terminated by signal {}", libc::WTERMSIG(status))));
    }
    if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
        return Err(Failure::Fault(format!("exited with status {}", libc::WEXITSTATUS(status))));
    }
    if let Err(e) = read {
        return Err(Failure::Fault(format!("result pipe failed: {}", e)));
    }

    let mut frame: ByteReader<'_> = ByteReader::new(&bytes);
    let decoded: Result<std::result::Result<T, Failure>> = frame.read_value::<u8>().and_then(|tag| match tag {
        RESULT_FRAME => T::decode(&mut frame).map(Ok),
        _ => frame
            .parse_ansi_string()
            .map(|message| Err(Failure::Panic(Box::new(message)))),
    });
    decoded.unwrap_or_else(|e| Err(Failure::Fault(format!("incomplete result: {}", e))))
}

#[cfg(unix)]
const RESULT_FRAME: u8 = 0;

#[cfg(unix)]
const PANIC_FRAME: u8 = 1;

#[cfg(unix)]
fn child_main<T: Transfer>(mut writer: std::fs::File, call: impl FnOnce() -> T) -> ! {
    use std::io::Write;

    // Faulting children leave no core files behind.
    let no_core = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    unsafe { libc::setrlimit(libc::RLIMIT_CORE, &no_core) };

    let mut frame: Vec<u8> = Vec::new();
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(value) => {
            write_value(&mut frame, RESULT_FRAME);
            value.encode(&mut frame);
        }
        Err(payload) => {
            write_value(&mut frame, PANIC_FRAME);
            write_blob(&mut frame, super::panic_message(payload.as_ref()).as_bytes());
        }
    }
    let code: libc::c_int = if writer.write_all(&frame).is_ok() { 0 } else { 1 };
    unsafe { libc::_exit(code) }
}

#[cfg(unix)]
fn reap(pid: libc::pid_t) -> std::result::Result<libc::c_int, Failure> {
    let mut status: libc::c_int = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status, 0) } == pid {
            return Ok(status);
        }
        let e = std::io::Error::last_os_error();
        if e.kind() != std::io::ErrorKind::Interrupted {
            return Err(Failure::Fault(format!("waitpid failed: {}", e)));
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn run_isolated<T: Transfer>(call: impl FnOnce() -> T) -> std::result::Result<T, Failure> {
    panic::catch_unwind(AssertUnwindSafe(call)).map_err(Failure::Panic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::testing::access_violation;
    use crate::compiler::{guarded, panic_message, E_FAIL};

    #[test]
    fn test_fault_unwinds_as_native_fault() {
        let payload = panic::catch_unwind(|| {
            isolated("Faulting call", || -> i32 {
                unsafe { access_violation() };
                7
            })
        })
        .err()
        .unwrap();
        let fault = payload.downcast_ref::<NativeFault>().unwrap();
        assert_eq!(fault.call, "Faulting call");
        assert!(panic_message(payload.as_ref()).starts_with("Faulting call faulted"));
    }

    #[test]
    fn test_guarded_maps_fault_to_none() {
        let survived = guarded("Faulting call", || isolated("Faulting call", || unsafe { access_violation() }));
        assert!(survived.is_none());
        // Still here, and the next call goes through.
        assert_eq!(guarded("Next call", || isolated("Next call", || 5i32)), Some(5));
    }

    #[test]
    fn test_panic_keeps_message() {
        let payload = panic::catch_unwind(|| isolated("Panicking call", || -> bool { panic!("bad include") }))
            .err()
            .unwrap();
        assert_eq!(panic_message(payload.as_ref()), "bad include");
    }

    #[test]
    fn test_results_cross_the_scope() {
        let (output, error): (CompileOutput, Option<WorkerError>) = isolated("Compile", || {
            (
                CompileOutput {
                    hresult: E_FAIL,
                    bytecode: vec![1, 2, 3],
                    errors: b"error X3000".to_vec(),
                },
                Some(WorkerError::plugin("include callback failed")),
            )
        });
        assert_eq!(output.hresult, E_FAIL);
        assert_eq!(output.bytecode, vec![1, 2, 3]);
        assert_eq!(output.errors, b"error X3000");
        let error = error.unwrap();
        assert!(matches!(error, WorkerError::Plugin { .. }));
        assert_eq!(error.message(), "include callback failed");
    }
}
