//! D3D9 Shader Backend
//!
//! # Payload (input version 0)
//! ```text
//! ansi sourceFile, ansi functionName, ansi shaderProfile, u32 compileFlags,
//! ansi includePath, include list, macro list
//! ```
//!
//! # Record
//! ```text
//! u8 1, u32 0 (D3D9Shader), i32 hresult,
//! u32 len + bytecode, u32 len + errors, u32 len + constant descriptors,
//! u32 len + disassembly
//! ```
//!
//! # Algorithm
//! 1. Compile under the exception guard.
//! 2. If the compiler faulted, retry once with the legacy compiler flag and a
//!    fresh macro list where `COMPILER_SUPPORTS_ATTRIBUTES` is `0`.
//! 3. A second fault becomes an ordinary `E_FAIL` compile failure.
//! 4. On success, extract the constant table and disassemble (guarded on
//!    its own; a fault there leaves the disassembly empty).

use super::{check_input_version, read_includes, read_macros, D3D9_INPUT_VERSION};
use crate::compiler::{
    ctab, guarded, with_macro_override, CompileOutput, CompileRequest, HlslCompiler, MacroList,
    COMPILER_SUPPORTS_ATTRIBUTES, LEGACY_COMPILER_FLAG,
};
use crate::error::Result;
use crate::protocol::batch::write_record_header;
use crate::protocol::codec::{write_blob, write_value, ByteReader};
use crate::protocol::JobType;
use crate::source::IncludeResolver;
use std::ffi::CString;

/// `backendOutputVersion` of D3D9 records.
pub const D3D9_OUTPUT_VERSION: u8 = 1;

/// Text reported when both compile attempts faulted.
pub const EXCEPTION_MESSAGE: &str = "D3D9 shader compiler raised an exception compiling this shader";

/// Compile one D3D9 job and append its record to `out`.
pub fn compile_d3d9_shader(
    input_version: u8,
    reader: &mut ByteReader<'_>,
    compiler: &dyn HlslCompiler,
    out: &mut Vec<u8>,
) -> Result<()> {
    check_input_version("D3D9", input_version, D3D9_INPUT_VERSION)?;

    let source: &[u8] = reader.read_ansi_bytes()?;
    let function_name: CString = reader.parse_ansi_cstring()?;
    let profile: CString = reader.parse_ansi_cstring()?;
    let compile_flags: u32 = reader.read_value()?;
    let include_path: String = reader.parse_ansi_string()?;
    let includes = read_includes(reader)?;
    let macros: MacroList = read_macros(reader)?;

    log::debug!(
        "D3D9 compile {} {} ({} includes, {} macros)",
        function_name.to_string_lossy(),
        profile.to_string_lossy(),
        includes.len(),
        macros.len()
    );

    let mut resolver: IncludeResolver = IncludeResolver::new(includes, include_path);
    let request: CompileRequest<'_> = CompileRequest {
        source_name: None,
        source,
        entry_point: &function_name,
        profile: &profile,
        flags: compile_flags,
        macros: &macros,
    };

    let attempt = guarded("D3D9 compile", || compiler.compile(&request, &mut resolver));
    resolver.take_error()?;
    let output: CompileOutput = match attempt {
        Some(output) => output,
        None => {
            log::warn!("Retrying {} with the legacy compiler", function_name.to_string_lossy());
            let legacy_macros: MacroList = with_macro_override(&macros, COMPILER_SUPPORTS_ATTRIBUTES, "0");
            let legacy_request: CompileRequest<'_> = CompileRequest {
                flags: compile_flags | LEGACY_COMPILER_FLAG,
                macros: &legacy_macros,
                ..request
            };
            let retry = guarded("D3D9 legacy compile", || compiler.compile(&legacy_request, &mut resolver));
            resolver.take_error()?;
            retry.unwrap_or_else(|| CompileOutput::exception(EXCEPTION_MESSAGE))
        }
    }
    .normalized();

    let mut descriptors: Vec<u8> = Vec::new();
    let mut disassembly: Vec<u8> = Vec::new();
    if output.succeeded() {
        descriptors = ctab::encode_constant_descriptors(&output.bytecode)?;
        disassembly = guarded("D3D9 disassemble", || compiler.disassemble(&output.bytecode))
            .flatten()
            .unwrap_or_default();
    }

    write_record_header(out, D3D9_OUTPUT_VERSION, JobType::D3D9Shader);
    write_value(out, output.hresult);
    write_blob(out, &output.bytecode);
    write_blob(out, &output.errors);
    write_blob(out, &descriptors);
    write_blob(out, &disassembly);
    Ok(())
}
