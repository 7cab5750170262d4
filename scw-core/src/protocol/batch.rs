//! Batch Framing
//!
//! # Input File
//! ```text
//! i32 batchInputVersion (= 0)
//! i32 numBatches
//! numBatches x { i32 jobId, i32 inputLength, i32 isEncrypted, u8[inputLength] payload }
//! ```
//!
//! # Output File
//! ```text
//! i32 batchOutputVersion (= 0)
//! i32 numBatches
//! numBatches x { i32 jobId, backend record }
//! ```
//!
//! A backend record always starts with `u8 backendOutputVersion, u32 jobType`.
//! The error record uses the same framing with a single entry whose job type
//! is [`JobType::WorkerError`].

use super::codec::{write_array, write_value, ByteReader};
use super::{JobType, BATCH_INPUT_VERSION, BATCH_OUTPUT_VERSION, ERROR_OUTPUT_VERSION};
use crate::cipher;
use crate::error::{ensure, Result};

/// Validate the input header and return the number of batched jobs.
#[track_caller]
pub fn read_input_header(reader: &mut ByteReader<'_>) -> Result<i32> {
    ensure(!reader.is_empty(), || "Worker input file is empty".to_string())?;
    let version: i32 = reader.read_value()?;
    ensure(version == BATCH_INPUT_VERSION, || {
        format!(
            "Worker input version {} does not match expected {}",
            version, BATCH_INPUT_VERSION
        )
    })?;
    let num_batches: i32 = reader.read_value()?;
    ensure(num_batches >= 0, || format!("Negative batch count {}", num_batches))?;
    Ok(num_batches)
}

/// Read the job id that opens a batch entry.
#[track_caller]
#[inline]
pub fn read_job_id(reader: &mut ByteReader<'_>) -> Result<i32> {
    reader.read_value()
}

/// Read the rest of a batch entry after its job id, decrypting the payload in place if flagged.
#[track_caller]
pub fn read_job_payload(reader: &mut ByteReader<'_>) -> Result<Vec<u8>> {
    let input_length: i32 = reader.read_value()?;
    ensure(input_length >= 0, || format!("Negative job input length {}", input_length))?;
    let is_encrypted: i32 = reader.read_value()?;
    let mut payload: Vec<u8> = reader.read_bytes(input_length as usize)?.to_vec();
    if is_encrypted != 0 {
        cipher::transform(&mut payload);
    }
    Ok(payload)
}

/// Start an output buffer for `num_batches` job records.
pub fn begin_output(num_batches: i32) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(64 * 1024);
    write_value(&mut out, BATCH_OUTPUT_VERSION);
    write_value(&mut out, num_batches);
    out
}

/// Write the common prefix of a backend record.
#[inline]
pub fn write_record_header(out: &mut Vec<u8>, backend_output_version: u8, job_type: JobType) {
    write_value(out, backend_output_version);
    write_value(out, job_type.as_raw());
}

/// Encode the complete error record file written when the worker aborts.
pub fn encode_error_record(job_id: i32, message: &str) -> Vec<u8> {
    let mut out: Vec<u8> = begin_output(1);
    write_value(&mut out, job_id);
    write_record_header(&mut out, ERROR_OUTPUT_VERSION, JobType::WorkerError);
    let units: Vec<u16> = message.encode_utf16().collect();
    write_value(&mut out, (units.len() * 2) as u32);
    for unit in units {
        write_value(&mut out, unit);
    }
    out
}

/// Decode an error record, returning the job id and message. Returns `None`
/// when the buffer holds ordinary job output.
pub fn decode_error_record(data: &[u8]) -> Result<Option<(i32, String)>> {
    let mut reader = ByteReader::new(data);
    let version: i32 = reader.read_value()?;
    ensure(version == BATCH_OUTPUT_VERSION, || format!("Unexpected output version {}", version))?;
    let num_batches: i32 = reader.read_value()?;
    if num_batches != 1 {
        return Ok(None);
    }
    let job_id: i32 = reader.read_value()?;
    let record_version: u8 = reader.read_value()?;
    let job_type: u32 = reader.read_value()?;
    if job_type != JobType::WorkerError.as_raw() {
        return Ok(None);
    }
    ensure(record_version == ERROR_OUTPUT_VERSION, || {
        format!("Unexpected error record version {}", record_version)
    })?;
    let units: Vec<u16> = reader.parse_unicode_string()?;
    Ok(Some((job_id, String::from_utf16_lossy(&units))))
}

/// Encode a batch input file. This is the parent's side of the framing; the
/// worker uses it for tooling and tests.
pub fn encode_batch_input(jobs: &[(i32, &[u8], bool)]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    write_value(&mut out, BATCH_INPUT_VERSION);
    write_value(&mut out, jobs.len() as i32);
    for (job_id, payload, encrypt) in jobs {
        write_value(&mut out, *job_id);
        write_value(&mut out, payload.len() as i32);
        write_value(&mut out, i32::from(*encrypt));
        let mut bytes: Vec<u8> = payload.to_vec();
        if *encrypt {
            cipher::transform(&mut bytes);
        }
        write_array(&mut out, &bytes);
    }
    out
}
