//! End-to-end batch tests through the public dispatcher API

use scw_core::compiler::ctab::build_sm3_with_ctab;
use scw_core::compiler::{CompileOutput, CompileRequest, HlslCompiler, E_FAIL, S_OK};
use scw_core::protocol::batch::{decode_error_record, encode_batch_input, encode_error_record};
use scw_core::protocol::codec::{to_wide, write_ansi_string, write_unicode_string, write_value, ByteReader};
use scw_core::source::IncludeResolver;
use scw_core::{process_batch, JobType, WorkerConfig, WorkerContext};

/// Accepts any source that defines `main`, rejects everything else.
struct ToyCompiler;

impl HlslCompiler for ToyCompiler {
    fn compile(&self, request: &CompileRequest<'_>, _includes: &mut IncludeResolver) -> CompileOutput {
        let text = String::from_utf8_lossy(request.source);
        if !text.contains("main") {
            return CompileOutput {
                hresult: E_FAIL,
                bytecode: Vec::new(),
                errors: b"error X3000: syntax error: unexpected token".to_vec(),
            };
        }
        let bytecode = if request.profile.to_bytes().starts_with(b"ps_3") {
            build_sm3_with_ctab(true, &[])
        } else {
            b"DXBC\x01\x02\x03\x04".to_vec()
        };
        CompileOutput {
            hresult: S_OK,
            bytecode,
            errors: Vec::new(),
        }
    }

    fn disassemble(&self, bytecode: &[u8]) -> Option<Vec<u8>> {
        Some(format!("// {} bytes\nps_3_0\nmov oC0, c0\n", bytecode.len()).into_bytes())
    }
}

fn toy_context() -> WorkerContext {
    WorkerContext::with_backends(
        WorkerConfig::default(),
        std::env::temp_dir(),
        Box::new(|_: JobType, _: &WorkerConfig| -> scw_core::Result<Box<dyn HlslCompiler>> { Ok(Box::new(ToyCompiler)) }),
        Box::new(scw_core::plugin::PluginCache::new(std::env::temp_dir().join("no-plugins-here"))),
    )
}

fn d3d9_payload(source: &str) -> Vec<u8> {
    let mut payload: Vec<u8> = Vec::new();
    write_value(&mut payload, JobType::D3D9Shader.as_raw());
    write_value(&mut payload, 0u8);
    write_ansi_string(&mut payload, source.as_bytes());
    write_ansi_string(&mut payload, b"main");
    write_ansi_string(&mut payload, b"ps_3_0");
    write_value(&mut payload, 0u32);
    write_ansi_string(&mut payload, b"");
    write_value(&mut payload, 0u32);
    write_value(&mut payload, 0u32);
    payload
}

fn d3d11_payload() -> Vec<u8> {
    let mut payload: Vec<u8> = Vec::new();
    write_value(&mut payload, JobType::D3D11Shader.as_raw());
    write_value(&mut payload, 0u8);
    write_ansi_string(&mut payload, b"Simple.usf");
    write_ansi_string(&mut payload, b"float4 main():SV_Target{return 0;}");
    write_ansi_string(&mut payload, b"main");
    write_ansi_string(&mut payload, b"ps_5_0");
    write_value(&mut payload, 0u32);
    write_ansi_string(&mut payload, b"");
    write_value(&mut payload, 0u32);
    write_value(&mut payload, 0u32);
    payload
}

struct D3D9Record {
    hresult: i32,
    bytecode: Vec<u8>,
    errors: Vec<u8>,
    constants: Vec<u8>,
    disassembly: Vec<u8>,
}

fn read_d3d9_record(reader: &mut ByteReader<'_>) -> D3D9Record {
    assert_eq!(reader.read_value::<u8>().unwrap(), 1);
    assert_eq!(reader.read_value::<u32>().unwrap(), JobType::D3D9Shader.as_raw());
    D3D9Record {
        hresult: reader.read_value().unwrap(),
        bytecode: reader.read_ansi_bytes().unwrap().to_vec(),
        errors: reader.read_ansi_bytes().unwrap().to_vec(),
        constants: reader.read_ansi_bytes().unwrap().to_vec(),
        disassembly: reader.read_ansi_bytes().unwrap().to_vec(),
    }
}

const MINIMAL_SOURCE: &str = "float4 main():SV_Target{return 0;}";

#[test]
fn test_minimal_d3d9_job() {
    let payload = d3d9_payload(MINIMAL_SOURCE);
    let output = process_batch(&encode_batch_input(&[(7, payload.as_slice(), false)]), &mut toy_context()).unwrap();

    let mut reader = ByteReader::new(&output);
    assert_eq!(reader.read_value::<i32>().unwrap(), 0);
    assert_eq!(reader.read_value::<i32>().unwrap(), 1);
    assert_eq!(reader.read_value::<i32>().unwrap(), 7);
    let record = read_d3d9_record(&mut reader);
    assert_eq!(record.hresult, 0);
    assert!(!record.bytecode.is_empty());
    assert!(record.errors.is_empty());
    assert!(record.constants.is_empty());
    assert!(!record.disassembly.is_empty());
    assert_eq!(reader.remaining(), 0);
}

#[test]
fn test_d3d9_compile_error_is_reported_not_fatal() {
    let payload = d3d9_payload("garbage");
    let mut ctx = toy_context();
    let output = process_batch(&encode_batch_input(&[(7, payload.as_slice(), false)]), &mut ctx).unwrap();

    let mut reader = ByteReader::new(&output);
    reader.read_bytes(12).unwrap();
    let record = read_d3d9_record(&mut reader);
    assert_ne!(record.hresult, 0);
    assert!(record.bytecode.is_empty());
    assert!(!record.errors.is_empty());
    assert!(record.constants.is_empty());
    assert!(record.disassembly.is_empty());

    // The same context keeps serving batches.
    let good = d3d9_payload(MINIMAL_SOURCE);
    assert!(process_batch(&encode_batch_input(&[(8, good.as_slice(), false)]), &mut ctx).is_ok());
}

#[test]
fn test_empty_source_fails_with_text() {
    let payload = d3d9_payload("");
    let output = process_batch(&encode_batch_input(&[(1, payload.as_slice(), false)]), &mut toy_context()).unwrap();
    let mut reader = ByteReader::new(&output);
    reader.read_bytes(12).unwrap();
    let record = read_d3d9_record(&mut reader);
    assert!(record.bytecode.is_empty());
    assert!(!record.errors.is_empty());
}

#[test]
fn test_encrypted_payload_matches_plain() {
    let payload = d3d9_payload(MINIMAL_SOURCE);
    let plain = process_batch(&encode_batch_input(&[(7, payload.as_slice(), false)]), &mut toy_context()).unwrap();
    let encrypted = process_batch(&encode_batch_input(&[(7, payload.as_slice(), true)]), &mut toy_context()).unwrap();
    assert_eq!(plain, encrypted);
}

#[test]
fn test_two_jobs_keep_order() {
    let first = d3d9_payload(MINIMAL_SOURCE);
    let second = d3d11_payload();
    let output = process_batch(
        &encode_batch_input(&[(1, first.as_slice(), false), (2, second.as_slice(), false)]),
        &mut toy_context(),
    )
    .unwrap();

    let mut reader = ByteReader::new(&output);
    assert_eq!(reader.read_value::<i32>().unwrap(), 0);
    assert_eq!(reader.read_value::<i32>().unwrap(), 2);

    assert_eq!(reader.read_value::<i32>().unwrap(), 1);
    read_d3d9_record(&mut reader);

    assert_eq!(reader.read_value::<i32>().unwrap(), 2);
    assert_eq!(reader.read_value::<u8>().unwrap(), 0);
    assert_eq!(reader.read_value::<u32>().unwrap(), JobType::D3D11Shader.as_raw());
    assert_eq!(reader.read_value::<i32>().unwrap(), S_OK);
    assert_eq!(reader.read_ansi_bytes().unwrap(), b"DXBC\x01\x02\x03\x04");
    assert_eq!(reader.read_ansi_bytes().unwrap(), b"");
    assert_eq!(reader.remaining(), 0);
}

#[test]
fn test_missing_plugin_becomes_error_record() {
    let root = tempfile::tempdir().unwrap();
    let exe_dir = root.path().join("Win64");
    std::fs::create_dir(&exe_dir).unwrap();
    let mut ctx = WorkerContext::new(WorkerConfig::default(), &exe_dir, root.path());

    let mut payload: Vec<u8> = Vec::new();
    write_value(&mut payload, JobType::WiiUShader.as_raw());
    write_value(&mut payload, 2u8);
    write_unicode_string(&mut payload, &to_wide("ExampleGame"));
    write_ansi_string(&mut payload, b"Simple");
    write_ansi_string(&mut payload, b"main");
    write_value(&mut payload, 0u8);
    write_value(&mut payload, 0u32);
    write_ansi_string(&mut payload, b"");
    write_value(&mut payload, 0u32);
    write_ansi_string(&mut payload, b"");
    write_value(&mut payload, 0u8);
    write_ansi_string(&mut payload, b"");

    let err = process_batch(&encode_batch_input(&[(11, payload.as_slice(), false)]), &mut ctx).unwrap_err();
    let record = encode_error_record(ctx.job_in_flight, &err.to_string());
    let (job_id, message) = decode_error_record(&record).unwrap().unwrap();
    assert_eq!(job_id, 11);
    assert!(message.contains("Failed to load console support dll"));
}

#[test]
fn test_empty_input_is_fatal() {
    let err = process_batch(&[], &mut toy_context()).unwrap_err();
    assert!(err.to_string().contains("empty"));
}
