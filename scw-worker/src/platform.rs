//! Process Helpers
//!
//! Thin wrappers over the OS calls the worker loop needs: debugger
//! detection, parent liveness, debug output and breaking into an attached
//! debugger.
//!
//! # Platforms
//! - **Windows**: `windows` crate (`IsDebuggerPresent`, `OpenProcess`, ...)
//! - **Unix**: `libc` (`kill(pid, 0)`, `SIGTRAP`) and `/proc/self/status`

use std::io;

/// Whether a debugger is attached to this process.
pub fn is_debugger_present() -> bool {
    imp::is_debugger_present()
}

/// Whether the process with `pid` is still alive.
pub fn is_process_running(pid: u32) -> bool {
    imp::is_process_running(pid)
}

/// Send one line to the attached debugger's output window.
pub fn output_debug_string(line: &str) {
    imp::output_debug_string(line)
}

/// Stop in the attached debugger.
pub fn debug_break() {
    imp::debug_break()
}

/// Whether `error` means another process holds the file open.
pub fn is_sharing_violation(error: &io::Error) -> bool {
    imp::is_sharing_violation(error)
}

#[cfg(windows)]
mod imp {
    use std::io;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, ERROR_LOCK_VIOLATION, ERROR_SHARING_VIOLATION, WAIT_TIMEOUT};
    use windows::Win32::System::Diagnostics::Debug::{DebugBreak, IsDebuggerPresent, OutputDebugStringW};
    use windows::Win32::System::Threading::{OpenProcess, WaitForSingleObject, PROCESS_SYNCHRONIZE};

    pub fn is_debugger_present() -> bool {
        unsafe { IsDebuggerPresent().as_bool() }
    }

    pub fn is_process_running(pid: u32) -> bool {
        unsafe {
            let handle = match OpenProcess(PROCESS_SYNCHRONIZE, false, pid) {
                Ok(handle) => handle,
                Err(_) => return false,
            };
            // A signaled process handle means the process has exited.
            let running: bool = WaitForSingleObject(handle, 0) == WAIT_TIMEOUT;
            let _ = CloseHandle(handle);
            running
        }
    }

    pub fn output_debug_string(line: &str) {
        let wide: Vec<u16> = line.encode_utf16().chain(std::iter::once(0)).collect();
        unsafe { OutputDebugStringW(PCWSTR(wide.as_ptr())) }
    }

    pub fn debug_break() {
        unsafe { DebugBreak() }
    }

    pub fn is_sharing_violation(error: &io::Error) -> bool {
        matches!(
            error.raw_os_error(),
            Some(code) if code == ERROR_SHARING_VIOLATION.0 as i32 || code == ERROR_LOCK_VIOLATION.0 as i32
        )
    }
}

#[cfg(unix)]
mod imp {
    use std::io;

    pub fn is_debugger_present() -> bool {
        let status: String = match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => status,
            Err(_) => return false,
        };
        status
            .lines()
            .find_map(|line| line.strip_prefix("TracerPid:"))
            .map(|pid| pid.trim() != "0")
            .unwrap_or(false)
    }

    pub fn is_process_running(pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        let rc: libc::c_int = unsafe { libc::kill(pid, 0) };
        // EPERM still proves the process exists.
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    pub fn output_debug_string(_line: &str) {}

    pub fn debug_break() {
        unsafe {
            libc::raise(libc::SIGTRAP);
        }
    }

    pub fn is_sharing_violation(error: &io::Error) -> bool {
        matches!(error.raw_os_error(), Some(libc::ETXTBSY) | Some(libc::EBUSY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_exited_child_is_not_running() {
        let mut child = std::process::Command::new(if cfg!(windows) { "cmd" } else { "true" })
            .args(if cfg!(windows) { &["/C", "exit"][..] } else { &[][..] })
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_running(pid));
    }

    #[test]
    fn test_plain_error_is_not_sharing_violation() {
        let error = io::Error::new(io::ErrorKind::PermissionDenied, "read-only");
        assert!(!is_sharing_violation(&error));
    }
}
