//! D3D11 Shader Backend
//!
//! # Payload (input version 0)
//! ```text
//! ansi sourceFileName, ansi sourceFile, ansi functionName, ansi shaderProfile,
//! u32 compileFlags, ansi includePath, include list, macro list
//! ```
//!
//! # Record
//! ```text
//! u8 0, u32 1 (D3D11Shader), i32 hresult, u32 len + bytecode, u32 len + errors
//! ```
//!
//! Compilation is guarded but never retried.

use super::{check_input_version, read_includes, read_macros, D3D11_INPUT_VERSION};
use crate::compiler::{guarded, CompileOutput, CompileRequest, HlslCompiler, MacroList};
use crate::error::Result;
use crate::protocol::batch::write_record_header;
use crate::protocol::codec::{write_blob, write_value, ByteReader};
use crate::protocol::JobType;
use crate::source::IncludeResolver;
use std::ffi::CString;

/// `backendOutputVersion` of D3D11 records.
pub const D3D11_OUTPUT_VERSION: u8 = 0;

pub const EXCEPTION_MESSAGE: &str = "D3D11 shader compiler raised an exception compiling this shader";

/// Compile one D3D11 job and append its record to `out`.
pub fn compile_d3d11_shader(
    input_version: u8,
    reader: &mut ByteReader<'_>,
    compiler: &dyn HlslCompiler,
    out: &mut Vec<u8>,
) -> Result<()> {
    check_input_version("D3D11", input_version, D3D11_INPUT_VERSION)?;

    let source_file_name: CString = reader.parse_ansi_cstring()?;
    let source: &[u8] = reader.read_ansi_bytes()?;
    let function_name: CString = reader.parse_ansi_cstring()?;
    let profile: CString = reader.parse_ansi_cstring()?;
    let compile_flags: u32 = reader.read_value()?;
    let include_path: String = reader.parse_ansi_string()?;
    let includes = read_includes(reader)?;
    let macros: MacroList = read_macros(reader)?;

    log::debug!(
        "D3D11 compile {}:{} {}",
        source_file_name.to_string_lossy(),
        function_name.to_string_lossy(),
        profile.to_string_lossy()
    );

    let mut resolver: IncludeResolver = IncludeResolver::new(includes, include_path);
    let request: CompileRequest<'_> = CompileRequest {
        source_name: Some(&source_file_name),
        source,
        entry_point: &function_name,
        profile: &profile,
        flags: compile_flags,
        macros: &macros,
    };
    let attempt = guarded("D3D11 compile", || compiler.compile(&request, &mut resolver));
    resolver.take_error()?;
    let output: CompileOutput = attempt
        .unwrap_or_else(|| CompileOutput::exception(EXCEPTION_MESSAGE))
        .normalized();

    write_record_header(out, D3D11_OUTPUT_VERSION, JobType::D3D11Shader);
    write_value(out, output.hresult);
    write_blob(out, &output.bytecode);
    write_blob(out, &output.errors);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::payload::{write_includes, write_macros};
    use crate::compiler::testing::FnCompiler;
    use crate::compiler::{E_FAIL, S_OK};
    use crate::error::WorkerError;
    use crate::protocol::codec::write_ansi_string;
    use std::cell::Cell;

    fn payload() -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        write_ansi_string(&mut buf, b"BasePassPixelShader.usf");
        write_ansi_string(&mut buf, b"#include \"Material.usf\"");
        write_ansi_string(&mut buf, b"Main");
        write_ansi_string(&mut buf, b"ps_5_0");
        write_value(&mut buf, 0u32);
        write_ansi_string(&mut buf, b"");
        write_includes(&mut buf, &[("Material.usf", "float3 BaseColor;")]);
        write_macros(&mut buf, &[("SM5_PROFILE", "1")]);
        buf
    }

    fn read_record(out: &[u8]) -> (i32, Vec<u8>, Vec<u8>) {
        let mut reader = ByteReader::new(out);
        assert_eq!(reader.read_value::<u8>().unwrap(), D3D11_OUTPUT_VERSION);
        assert_eq!(reader.read_value::<u32>().unwrap(), 1);
        let hresult = reader.read_value::<i32>().unwrap();
        let bytecode = reader.read_ansi_bytes().unwrap().to_vec();
        let errors = reader.read_ansi_bytes().unwrap().to_vec();
        assert_eq!(reader.remaining(), 0);
        (hresult, bytecode, errors)
    }

    #[test]
    fn test_successful_compile() {
        let compiler = FnCompiler::new(
            |request: &CompileRequest<'_>, includes: &mut IncludeResolver| {
                assert_eq!(request.source_name.unwrap().to_bytes(), b"BasePassPixelShader.usf");
                assert_eq!(request.macros.len(), 1);
                let body = includes.open("Material.usf").unwrap().unwrap().to_vec();
                assert_eq!(body, b"float3 BaseColor;\0");
                CompileOutput {
                    hresult: S_OK,
                    bytecode: b"DXBC....".to_vec(),
                    errors: b"warning X3206: implicit truncation".to_vec(),
                }
            },
            |_: &[u8]| None,
        );
        let input = payload();
        let mut reader = ByteReader::new(&input);
        let mut out: Vec<u8> = Vec::new();
        compile_d3d11_shader(0, &mut reader, &compiler, &mut out).unwrap();

        let (hresult, bytecode, errors) = read_record(&out);
        assert_eq!(hresult, S_OK);
        assert_eq!(bytecode, b"DXBC....");
        assert_eq!(errors, b"warning X3206: implicit truncation");
    }

    #[test]
    fn test_exception_is_not_retried() {
        let attempts: Cell<u32> = Cell::new(0);
        let compiler = FnCompiler::new(
            |_: &CompileRequest<'_>, _: &mut IncludeResolver| -> CompileOutput {
                attempts.set(attempts.get() + 1);
                panic!("compiler crashed")
            },
            |_: &[u8]| None,
        );
        let input = payload();
        let mut reader = ByteReader::new(&input);
        let mut out: Vec<u8> = Vec::new();
        compile_d3d11_shader(0, &mut reader, &compiler, &mut out).unwrap();

        assert_eq!(attempts.get(), 1);
        let (hresult, bytecode, errors) = read_record(&out);
        assert_eq!(hresult, E_FAIL);
        assert!(bytecode.is_empty());
        assert_eq!(errors, EXCEPTION_MESSAGE.as_bytes());
    }

    #[test]
    fn test_include_callback_error_is_fatal() {
        let compiler = FnCompiler::new(
            |_: &CompileRequest<'_>, includes: &mut IncludeResolver| {
                includes.defer_error(WorkerError::io_message("Short read of Broken.bin"));
                CompileOutput {
                    hresult: E_FAIL,
                    bytecode: Vec::new(),
                    errors: Vec::new(),
                }
            },
            |_: &[u8]| None,
        );
        let input = payload();
        let mut reader = ByteReader::new(&input);
        let mut out: Vec<u8> = Vec::new();
        let err = compile_d3d11_shader(0, &mut reader, &compiler, &mut out).unwrap_err();
        assert!(err.message().contains("Broken.bin"));
    }

    #[test]
    fn test_truncated_payload() {
        let compiler = FnCompiler::new(
            |_: &CompileRequest<'_>, _: &mut IncludeResolver| CompileOutput::default(),
            |_: &[u8]| None,
        );
        let mut input = payload();
        input.truncate(input.len() - 2);
        let mut reader = ByteReader::new(&input);
        let mut out: Vec<u8> = Vec::new();
        assert!(compile_d3d11_shader(0, &mut reader, &compiler, &mut out).is_err());
    }
}
