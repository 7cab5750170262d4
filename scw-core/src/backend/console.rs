//! Console Shader Backend
//!
//! Xbox 360, PS3 and Wii U jobs go through the platform's console support
//! plugin (see [`crate::plugin`]).
//!
//! # Payload (input version 2)
//! ```text
//! unicode gameName, ansi sourceFileName, ansi functionName, u8 bIsVertexShader,
//! u32 compileFlags, ansi includePath, include list, ansi definitions,
//! u8 bDumpPDBs, ansi pdbPath
//! ```
//!
//! # Record
//! ```text
//! u8 0, u32 jobType, u8 success,
//! u32 len + bytecode, u32 len + constant text, u32 len + error text
//! ```
//!
//! The PS3 compiler only reads real files, so its source and includes are
//! written into the working directory and the plugin gets a path instead of
//! in-memory includes.

use super::{check_input_version, read_includes, CONSOLE_INPUT_VERSION};
use crate::compiler::guarded;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::plugin::{PrecompileBuffers, PrecompileRequest, PrecompilerProvider};
use crate::protocol::batch::write_record_header;
use crate::protocol::codec::{write_blob, write_value, ByteReader};
use crate::protocol::JobType;
use crate::source::Include;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `backendOutputVersion` of console records.
pub const CONSOLE_OUTPUT_VERSION: u8 = 0;

pub const EXCEPTION_MESSAGE: &str = "Console shader precompiler raised an exception compiling this shader";

/// Worker state a console job reads.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleEnvironment<'a> {
    pub working_dir: &'a Path,
    pub config: &'a WorkerConfig,
}

/// Compile one console job and append its record to `out`.
pub fn compile_console_shader(
    job_type: JobType,
    input_version: u8,
    reader: &mut ByteReader<'_>,
    plugins: &mut dyn PrecompilerProvider,
    env: &ConsoleEnvironment<'_>,
    out: &mut Vec<u8>,
) -> Result<()> {
    check_input_version("Console", input_version, CONSOLE_INPUT_VERSION)?;

    let game_name: Vec<u16> = reader.parse_unicode_string()?;
    let source_file_name: String = reader.parse_ansi_string()?;
    let function_name: CString = reader.parse_ansi_cstring()?;
    let is_vertex_shader: bool = reader.read_bool()?;
    let compile_flags: u32 = reader.read_value()?;
    let include_directory: CString = reader.parse_ansi_cstring()?;
    let includes: Vec<Include> = read_includes(reader)?;
    let definitions: CString = reader.parse_ansi_cstring()?;
    let dump_pdbs: bool = reader.read_bool()?;
    let pdb_path: CString = reader.parse_ansi_cstring()?;

    let precompiler = plugins.precompiler(job_type, &game_name)?;

    let shader_path: CString;
    let mut include_names: Vec<CString> = Vec::new();
    let mut include_contents: Vec<&CStr> = Vec::new();
    if job_type == JobType::Ps3Shader {
        let source_path: PathBuf = materialize_includes(env, &source_file_name, &includes)?;
        shader_path = narrow_path(&source_path)?;
    } else {
        shader_path = to_cstring(source_file_name.as_bytes())?;
        for include in &includes {
            include_names.push(to_cstring(include.name.as_bytes())?);
            include_contents.push(include_text(include)?);
        }
    }
    let include_name_refs: Vec<&CStr> = include_names.iter().map(CString::as_c_str).collect();

    log::debug!(
        "{:?} precompile {} {} ({} includes)",
        job_type,
        shader_path.to_string_lossy(),
        function_name.to_string_lossy(),
        includes.len()
    );

    let request: PrecompileRequest<'_> = PrecompileRequest {
        shader_path: &shader_path,
        entry_function: &function_name,
        is_vertex_shader,
        compile_flags,
        definitions: &definitions,
        include_directory: &include_directory,
        include_names: &include_name_refs,
        include_contents: &include_contents,
        dump_pdbs,
        pdb_path: &pdb_path,
    };
    let config: &WorkerConfig = env.config;
    let mut buffers: PrecompileBuffers = PrecompileBuffers::new(
        config.console_bytecode_capacity,
        config.console_constant_capacity,
        config.console_error_capacity,
    );
    let success: bool = match guarded("Console precompile", || precompiler.precompile_shader(&request, &mut buffers)) {
        Some(success) => success,
        None => {
            buffers = PrecompileBuffers::new(0, 0, EXCEPTION_MESSAGE.len() + 1);
            buffers.errors[..EXCEPTION_MESSAGE.len()].copy_from_slice(EXCEPTION_MESSAGE.as_bytes());
            false
        }
    };

    write_record_header(out, CONSOLE_OUTPUT_VERSION, job_type);
    write_value(out, u8::from(success));
    write_blob(out, buffers.bytecode()?);
    write_blob(out, buffers.constants());
    write_blob(out, buffers.errors());
    Ok(())
}

/// Write every include into the working directory and return the source path.
fn materialize_includes(env: &ConsoleEnvironment<'_>, source_file_name: &str, includes: &[Include]) -> Result<PathBuf> {
    // Paths handed to the plugin must be narrow.
    if env.working_dir.to_str().is_none() {
        return Err(WorkerError::io_message(format!(
            "Couldn't convert working directory {} to a narrow path",
            env.working_dir.display()
        )));
    }
    for include in includes {
        let path: PathBuf = env.working_dir.join(&include.name);
        write_with_retries(&path, include.body(), env.config.file_retry_count, env.config.file_retry_interval())?;
    }
    Ok(env.working_dir.join(format!("{}.usf", source_file_name)))
}

/// Write `contents` to `path`, retrying while another process holds the file.
pub fn write_with_retries(path: &Path, contents: &[u8], attempts: u32, interval: Duration) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match std::fs::write(path, contents) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                log::debug!("Retrying write of {} after {}", path.display(), e);
                std::thread::sleep(interval);
            }
            Err(e) => {
                return Err(WorkerError::io(
                    format!(
                        "Couldn't write {} after {} attempts: OS error {} ({:?})",
                        path.display(),
                        attempt,
                        e.raw_os_error().unwrap_or(0),
                        e.kind()
                    ),
                    e,
                ))
            }
        }
    }
}

fn narrow_path(path: &Path) -> Result<CString> {
    let narrow: &str = path
        .to_str()
        .ok_or_else(|| WorkerError::io_message(format!("Couldn't convert {} to a narrow path", path.display())))?;
    to_cstring(narrow.as_bytes())
}

fn to_cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|e| WorkerError::protocol(format!("String has an embedded NUL at byte {}", e.nul_position())))
}

fn include_text(include: &Include) -> Result<&CStr> {
    CStr::from_bytes_until_nul(include.body_with_nul())
        .map_err(|_| WorkerError::protocol(format!("Include {} is not terminated", include.name)))
}
