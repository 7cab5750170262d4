//! Worker Wire Protocol
//!
//! Everything the parent engine and the worker must agree on bit-exactly:
//! the job type enumeration, the per-layer version numbers, the primitive
//! codec and the batch framing.
//!
//! All multi-byte values are little-endian. The parent and the worker always
//! run on the same machine, so no byte-order negotiation exists.

pub mod batch;
pub mod codec;

use crate::error::{Result, WorkerError};

/// Version of the batch input file header.
pub const BATCH_INPUT_VERSION: i32 = 0;
/// Version of the batch output file header.
pub const BATCH_OUTPUT_VERSION: i32 = 0;
/// Version of the error record that replaces the batch output on a fatal error.
pub const ERROR_OUTPUT_VERSION: u8 = 0;

/// Job type tag at the start of every job payload and echoed in every job record.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobType {
    D3D9Shader = 0,
    D3D11Shader = 1,
    XenonShader = 2,
    Ps3Shader = 3,
    WiiUShader = 4,
    WorkerError = 5,
}

impl JobType {
    /// Decode a raw job type tag.
    #[track_caller]
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::D3D9Shader),
            1 => Ok(Self::D3D11Shader),
            2 => Ok(Self::XenonShader),
            3 => Ok(Self::Ps3Shader),
            4 => Ok(Self::WiiUShader),
            5 => Ok(Self::WorkerError),
            _ => Err(WorkerError::protocol(format!("Unknown job type {}", raw))),
        }
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// True for job types compiled through a console support plugin.
    #[inline]
    pub fn is_console(self) -> bool {
        matches!(self, Self::XenonShader | Self::Ps3Shader | Self::WiiUShader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_round_trip() {
        for raw in 0u32..=5 {
            assert_eq!(JobType::from_raw(raw).unwrap().as_raw(), raw);
        }
    }

    #[test]
    fn test_unknown_job_type() {
        let err = JobType::from_raw(6).unwrap_err();
        assert!(err.message().contains("Unknown job type 6"));
    }

    #[test]
    fn test_console_types() {
        assert!(JobType::Ps3Shader.is_console());
        assert!(JobType::XenonShader.is_console());
        assert!(JobType::WiiUShader.is_console());
        assert!(!JobType::D3D9Shader.is_console());
        assert!(!JobType::WorkerError.is_console());
    }
}
