//! Host HLSL Compiler Binding
//!
//! Loads `D3DCompile` and `D3DDisassemble` from a dynamic library at runtime
//! (`d3dcompiler_47` by default) and adapts them to [`HlslCompiler`].
//!
//! # ABI Pieces
//! - `ID3DBlob`: COM object returned for bytecode, diagnostics and
//!   disassembly. Wrapped in [`Blob`], which releases it on drop.
//! - `ID3DInclude`: plain vtable the compiler calls for every `#include`.
//!   [`IncludeShim`] lays one out in front of a pointer to the job's
//!   [`IncludeResolver`].
//! - `D3D_SHADER_MACRO`: name/definition pairs ending with a null pair.

use super::isolate::isolated;
use super::{CompileOutput, CompileRequest, HlslCompiler, E_FAIL, S_OK};
use crate::error::{Result, WorkerError};
use crate::source::IncludeResolver;
use libloading::Library;
use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};

type D3DCompileFn = unsafe extern "system" fn(
    src_data: *const c_void,
    src_data_size: usize,
    source_name: *const c_char,
    defines: *const RawShaderMacro,
    include: *mut IncludeShim,
    entry_point: *const c_char,
    target: *const c_char,
    flags1: u32,
    flags2: u32,
    code: *mut *mut RawBlob,
    error_msgs: *mut *mut RawBlob,
) -> i32;

type D3DDisassembleFn = unsafe extern "system" fn(
    src_data: *const c_void,
    src_data_size: usize,
    flags: u32,
    comments: *const c_char,
    disassembly: *mut *mut RawBlob,
) -> i32;

/// `D3D_SHADER_MACRO`.
#[repr(C)]
struct RawShaderMacro {
    name: *const c_char,
    definition: *const c_char,
}

#[repr(C)]
struct BlobVtbl {
    query_interface: *const c_void,
    add_ref: unsafe extern "system" fn(this: *mut RawBlob) -> u32,
    release: unsafe extern "system" fn(this: *mut RawBlob) -> u32,
    get_buffer_pointer: unsafe extern "system" fn(this: *mut RawBlob) -> *mut c_void,
    get_buffer_size: unsafe extern "system" fn(this: *mut RawBlob) -> usize,
}

#[repr(C)]
struct RawBlob {
    vtbl: *const BlobVtbl,
}

/// Owned `ID3DBlob`.
pub struct Blob {
    raw: NonNull<RawBlob>,
}

impl Blob {
    /// Take ownership of a blob reference.
    ///
    /// # Safety
    /// `raw` must be null or a live `ID3DBlob` whose reference is transferred.
    unsafe fn from_raw(raw: *mut RawBlob) -> Option<Self> {
        NonNull::new(raw).map(|raw| Self { raw })
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            let this: *mut RawBlob = self.raw.as_ptr();
            let vtbl: &BlobVtbl = &*(*this).vtbl;
            let data: *const u8 = (vtbl.get_buffer_pointer)(this) as *const u8;
            let size: usize = (vtbl.get_buffer_size)(this);
            if data.is_null() || size == 0 {
                &[]
            } else {
                std::slice::from_raw_parts(data, size)
            }
        }
    }

    /// Contents as text bytes with trailing NULs removed.
    pub fn to_text(&self) -> Vec<u8> {
        trim_trailing_nuls(self.as_bytes()).to_vec()
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        unsafe {
            let this: *mut RawBlob = self.raw.as_ptr();
            ((*(*this).vtbl).release)(this);
        }
    }
}

/// Strip the terminators the compiler leaves on text blobs.
pub fn trim_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let end: usize = bytes.iter().rposition(|&b| b != 0).map_or(0, |last| last + 1);
    &bytes[..end]
}

#[repr(C)]
struct IncludeVtbl {
    open: unsafe extern "system" fn(
        this: *mut IncludeShim,
        include_type: u32,
        file_name: *const c_char,
        parent_data: *const c_void,
        data: *mut *const c_void,
        bytes: *mut u32,
    ) -> i32,
    close: unsafe extern "system" fn(this: *mut IncludeShim, data: *const c_void) -> i32,
}

static INCLUDE_VTBL: IncludeVtbl = IncludeVtbl {
    open: include_open,
    close: include_close,
};

/// `ID3DInclude` laid out in front of the resolver for one compile call.
#[repr(C)]
pub struct IncludeShim {
    vtbl: *const IncludeVtbl,
    resolver: *mut IncludeResolver,
}

impl IncludeShim {
    pub fn new(resolver: &mut IncludeResolver) -> Self {
        Self {
            vtbl: &INCLUDE_VTBL,
            resolver,
        }
    }
}

unsafe extern "system" fn include_open(
    this: *mut IncludeShim,
    _include_type: u32,
    file_name: *const c_char,
    _parent_data: *const c_void,
    data: *mut *const c_void,
    bytes: *mut u32,
) -> i32 {
    if this.is_null() || file_name.is_null() || data.is_null() || bytes.is_null() {
        return E_FAIL;
    }
    let resolver: &mut IncludeResolver = &mut *(*this).resolver;
    let name: String = CStr::from_ptr(file_name).to_string_lossy().into_owned();

    // Unwinding must stop here; it cannot cross back into the compiler.
    let opened = panic::catch_unwind(AssertUnwindSafe(|| {
        resolver.open(&name).map(|found| found.map(|body| (body.as_ptr(), body.len())))
    }));
    match opened {
        Ok(Ok(Some((body, len_with_nul)))) => {
            *data = body as *const c_void;
            *bytes = (len_with_nul - 1) as u32;
            S_OK
        }
        Ok(Ok(None)) => E_FAIL,
        Ok(Err(error)) => {
            resolver.defer_error(error);
            E_FAIL
        }
        Err(payload) => {
            resolver.defer_error(WorkerError::io_message(format!(
                "Include callback for {} panicked: {}",
                name,
                super::panic_message(payload.as_ref())
            )));
            E_FAIL
        }
    }
}

unsafe extern "system" fn include_close(this: *mut IncludeShim, data: *const c_void) -> i32 {
    if this.is_null() {
        return E_FAIL;
    }
    let resolver: &mut IncludeResolver = &mut *(*this).resolver;
    resolver.close(data as *const u8);
    S_OK
}

/// `D3DCompile`/`D3DDisassemble` pulled from a dynamic library.
pub struct HostCompiler {
    compile_fn: D3DCompileFn,
    disassemble_fn: Option<D3DDisassembleFn>,
    /// Keeps the function pointers valid. `None` when they are linked in.
    _library: Option<Library>,
}

impl HostCompiler {
    /// Load the compiler library at `path` (a file name or full path).
    ///
    /// # Returns
    /// A plugin error if the library or its `D3DCompile` export is missing.
    pub fn load(path: &str) -> Result<Self> {
        log::info!("Loading HLSL compiler from {}", path);
        unsafe {
            let library: Library = Library::new(path)
                .map_err(|e| WorkerError::plugin(format!("Failed to load HLSL compiler {}: {}", path, e)))?;
            let compile_fn: D3DCompileFn = *library
                .get::<D3DCompileFn>(b"D3DCompile\0")
                .map_err(|e| WorkerError::plugin(format!("{} does not export D3DCompile: {}", path, e)))?;
            let disassemble_fn: Option<D3DDisassembleFn> = match library.get::<D3DDisassembleFn>(b"D3DDisassemble\0") {
                Ok(symbol) => Some(*symbol),
                Err(e) => {
                    log::warn!("{} does not export D3DDisassemble: {}", path, e);
                    None
                }
            };
            Ok(Self {
                compile_fn,
                disassemble_fn,
                _library: Some(library),
            })
        }
    }

    #[cfg(test)]
    fn from_fns(compile_fn: D3DCompileFn, disassemble_fn: Option<D3DDisassembleFn>) -> Self {
        Self {
            compile_fn,
            disassemble_fn,
            _library: None,
        }
    }
}

/// One raw `D3DCompile` call.
///
/// # Safety
/// `compile_fn` must follow the `D3DCompile` contract.
unsafe fn call_compile(
    compile_fn: D3DCompileFn,
    request: &CompileRequest<'_>,
    includes: &mut IncludeResolver,
) -> CompileOutput {
    let mut defines: Vec<RawShaderMacro> = request
        .macros
        .iter()
        .map(|m| RawShaderMacro {
            name: m.name.as_ptr(),
            definition: m.definition.as_ptr(),
        })
        .collect();
    defines.push(RawShaderMacro {
        name: ptr::null(),
        definition: ptr::null(),
    });

    let mut shim: IncludeShim = IncludeShim::new(includes);
    let mut code: *mut RawBlob = ptr::null_mut();
    let mut errors: *mut RawBlob = ptr::null_mut();
    let hresult: i32 = compile_fn(
        request.source.as_ptr() as *const c_void,
        request.source.len(),
        request.source_name.map_or(ptr::null(), CStr::as_ptr),
        defines.as_ptr(),
        &mut shim,
        request.entry_point.as_ptr(),
        request.profile.as_ptr(),
        request.flags,
        0,
        &mut code,
        &mut errors,
    );
    let code: Option<Blob> = Blob::from_raw(code);
    let errors: Option<Blob> = Blob::from_raw(errors);

    CompileOutput {
        hresult,
        bytecode: code.map(|blob| blob.as_bytes().to_vec()).unwrap_or_default(),
        errors: errors.map(|blob| blob.to_text()).unwrap_or_default(),
    }
}

impl HlslCompiler for HostCompiler {
    fn compile(&self, request: &CompileRequest<'_>, includes: &mut IncludeResolver) -> CompileOutput {
        let compile_fn: D3DCompileFn = self.compile_fn;
        // Errors parked by the include callbacks travel back with the output.
        let (output, include_error): (CompileOutput, Option<WorkerError>) = isolated("D3DCompile", || {
            let output: CompileOutput = unsafe { call_compile(compile_fn, request, includes) };
            (output, includes.take_error().err())
        });
        if let Some(error) = include_error {
            includes.defer_error(error);
        }
        output
    }

    fn disassemble(&self, bytecode: &[u8]) -> Option<Vec<u8>> {
        let disassemble_fn: D3DDisassembleFn = self.disassemble_fn?;
        let (hresult, text): (i32, Option<Vec<u8>>) = isolated("D3DDisassemble", || unsafe {
            let mut text: *mut RawBlob = ptr::null_mut();
            let hresult: i32 = disassemble_fn(
                bytecode.as_ptr() as *const c_void,
                bytecode.len(),
                0,
                ptr::null(),
                &mut text,
            );
            let text: Option<Blob> = Blob::from_raw(text);
            (hresult, text.map(|blob| blob.to_text()))
        });
        if hresult < 0 {
            log::warn!("D3DDisassemble failed with 0x{:08X}", hresult as u32);
            return None;
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::d3d9::{compile_d3d9_shader, D3D9_OUTPUT_VERSION, EXCEPTION_MESSAGE};
    use crate::backend::payload::{write_includes, write_macros};
    use crate::compiler::testing::access_violation;
    use crate::compiler::LEGACY_COMPILER_FLAG;
    use crate::protocol::codec::{write_ansi_string, write_value, ByteReader};
    use crate::source::Include;
    use std::ffi::CString;

    /// Status the legacy attempt answers with.
    const LEGACY_STATUS: i32 = 0x8876_0001_u32 as i32;

    #[allow(clippy::too_many_arguments)]
    unsafe extern "system" fn faults_unless_legacy(
        _src_data: *const c_void,
        _src_data_size: usize,
        _source_name: *const c_char,
        _defines: *const RawShaderMacro,
        _include: *mut IncludeShim,
        _entry_point: *const c_char,
        _target: *const c_char,
        flags1: u32,
        _flags2: u32,
        _code: *mut *mut RawBlob,
        _error_msgs: *mut *mut RawBlob,
    ) -> i32 {
        if flags1 & LEGACY_COMPILER_FLAG != 0 {
            return LEGACY_STATUS;
        }
        access_violation();
        S_OK
    }

    #[allow(clippy::too_many_arguments)]
    unsafe extern "system" fn always_faults(
        _src_data: *const c_void,
        _src_data_size: usize,
        _source_name: *const c_char,
        _defines: *const RawShaderMacro,
        _include: *mut IncludeShim,
        _entry_point: *const c_char,
        _target: *const c_char,
        _flags1: u32,
        _flags2: u32,
        _code: *mut *mut RawBlob,
        _error_msgs: *mut *mut RawBlob,
    ) -> i32 {
        access_violation();
        S_OK
    }

    /// Opens its include, then faults.
    #[allow(clippy::too_many_arguments)]
    unsafe extern "system" fn faults_after_include(
        _src_data: *const c_void,
        _src_data_size: usize,
        _source_name: *const c_char,
        _defines: *const RawShaderMacro,
        include: *mut IncludeShim,
        _entry_point: *const c_char,
        _target: *const c_char,
        _flags1: u32,
        _flags2: u32,
        _code: *mut *mut RawBlob,
        _error_msgs: *mut *mut RawBlob,
    ) -> i32 {
        let name = b"Common.usf\0";
        let mut data: *const c_void = ptr::null();
        let mut bytes: u32 = 0;
        ((*(*include).vtbl).open)(include, 0, name.as_ptr() as *const c_char, ptr::null(), &mut data, &mut bytes);
        access_violation();
        S_OK
    }

    /// Reports a broken include and fails normally.
    #[allow(clippy::too_many_arguments)]
    unsafe extern "system" fn fails_on_broken_include(
        _src_data: *const c_void,
        _src_data_size: usize,
        _source_name: *const c_char,
        _defines: *const RawShaderMacro,
        include: *mut IncludeShim,
        _entry_point: *const c_char,
        _target: *const c_char,
        _flags1: u32,
        _flags2: u32,
        _code: *mut *mut RawBlob,
        _error_msgs: *mut *mut RawBlob,
    ) -> i32 {
        let name = b"Broken.usf\0";
        let mut data: *const c_void = ptr::null();
        let mut bytes: u32 = 0;
        ((*(*include).vtbl).open)(include, 0, name.as_ptr() as *const c_char, ptr::null(), &mut data, &mut bytes)
    }

    unsafe extern "system" fn faulting_disassemble(
        _src_data: *const c_void,
        _src_data_size: usize,
        _flags: u32,
        _comments: *const c_char,
        _disassembly: *mut *mut RawBlob,
    ) -> i32 {
        access_violation();
        S_OK
    }

    fn d3d9_payload() -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        write_ansi_string(&mut buf, b"float4 Main() : COLOR { return 0; }");
        write_ansi_string(&mut buf, b"Main");
        write_ansi_string(&mut buf, b"ps_3_0");
        write_value(&mut buf, 0u32);
        write_ansi_string(&mut buf, b"");
        write_includes(&mut buf, &[("Common.usf", "float4 Tint;")]);
        write_macros(&mut buf, &[]);
        buf
    }

    /// Status and error text of a D3D9 record.
    fn d3d9_status(out: &[u8]) -> (i32, Vec<u8>) {
        let mut reader = ByteReader::new(out);
        assert_eq!(reader.read_value::<u8>().unwrap(), D3D9_OUTPUT_VERSION);
        assert_eq!(reader.read_value::<u32>().unwrap(), 0);
        let hresult = reader.read_value::<i32>().unwrap();
        assert!(reader.read_ansi_bytes().unwrap().is_empty());
        (hresult, reader.read_ansi_bytes().unwrap().to_vec())
    }

    #[test]
    fn test_compiler_fault_retries_with_legacy_flag() {
        let compiler = HostCompiler::from_fns(faults_unless_legacy, None);
        let input = d3d9_payload();
        let mut reader = ByteReader::new(&input);
        let mut out: Vec<u8> = Vec::new();
        compile_d3d9_shader(0, &mut reader, &compiler, &mut out).unwrap();

        let (hresult, errors) = d3d9_status(&out);
        assert_eq!(hresult, LEGACY_STATUS);
        assert!(String::from_utf8_lossy(&errors).contains("88760001"));
    }

    #[test]
    fn test_repeated_compiler_fault_is_exception_record() {
        let compiler = HostCompiler::from_fns(always_faults, None);
        let input = d3d9_payload();
        let mut reader = ByteReader::new(&input);
        let mut out: Vec<u8> = Vec::new();
        compile_d3d9_shader(0, &mut reader, &compiler, &mut out).unwrap();

        let (hresult, errors) = d3d9_status(&out);
        assert_eq!(hresult, E_FAIL);
        assert_eq!(errors, EXCEPTION_MESSAGE.as_bytes());

        // The worker is still alive for the next job.
        let mut reader = ByteReader::new(&input);
        let mut out: Vec<u8> = Vec::new();
        compile_d3d9_shader(0, &mut reader, &compiler, &mut out).unwrap();
        assert_eq!(d3d9_status(&out).0, E_FAIL);
    }

    #[test]
    fn test_fault_after_include_open_is_none() {
        let compiler = HostCompiler::from_fns(faults_after_include, None);
        let mut resolver = IncludeResolver::new(vec![Include::new("Common.usf", b"float x;")], "");
        let entry = CString::new("Main").unwrap();
        let profile = CString::new("ps_3_0").unwrap();
        let request = CompileRequest {
            source_name: None,
            source: b"",
            entry_point: &entry,
            profile: &profile,
            flags: 0,
            macros: &[],
        };
        assert!(crate::compiler::guarded("D3D9 compile", || compiler.compile(&request, &mut resolver)).is_none());
        assert!(resolver.take_error().is_ok());
    }

    #[test]
    fn test_include_error_crosses_fault_scope() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::source::loader::binary_source_path(dir.path(), "Broken.usf");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [0u8; 3]).unwrap();

        let compiler = HostCompiler::from_fns(fails_on_broken_include, None);
        let mut resolver = IncludeResolver::new(Vec::new(), dir.path());
        let entry = CString::new("Main").unwrap();
        let profile = CString::new("ps_3_0").unwrap();
        let request = CompileRequest {
            source_name: None,
            source: b"",
            entry_point: &entry,
            profile: &profile,
            flags: 0,
            macros: &[],
        };
        let output = compiler.compile(&request, &mut resolver);
        assert_eq!(output.hresult, E_FAIL);
        assert!(resolver.take_error().is_err());
    }

    #[test]
    fn test_disassembler_fault_is_none() {
        let compiler = HostCompiler::from_fns(always_faults, Some(faulting_disassemble));
        let disassembly = crate::compiler::guarded("D3D9 disassemble", || compiler.disassemble(&[0, 3, 0xFF, 0xFF]));
        assert!(disassembly.is_none());
    }

    #[test]
    fn test_missing_library_is_plugin_error() {
        let err = HostCompiler::load("definitely_not_a_compiler_library").err().unwrap();
        assert!(matches!(err, WorkerError::Plugin { .. }));
        assert!(err.message().contains("Failed to load HLSL compiler"));
    }

    #[test]
    fn test_trim_trailing_nuls() {
        assert_eq!(trim_trailing_nuls(b"error X3000\0\0"), b"error X3000");
        assert_eq!(trim_trailing_nuls(b"\0"), b"");
        assert_eq!(trim_trailing_nuls(b"ok"), b"ok");
    }

    #[test]
    fn test_include_shim_open_close() {
        let mut resolver = IncludeResolver::new(vec![Include::new("Common.usf", b"float x;")], "");
        let mut shim = IncludeShim::new(&mut resolver);
        let name = CString::new("Common.usf").unwrap();
        let mut data: *const c_void = ptr::null();
        let mut bytes: u32 = 0;
        unsafe {
            let hr = include_open(&mut shim, 0, name.as_ptr(), ptr::null(), &mut data, &mut bytes);
            assert_eq!(hr, S_OK);
            assert_eq!(bytes, 8);
            let body = std::slice::from_raw_parts(data as *const u8, bytes as usize);
            assert_eq!(body, b"float x;");
            assert_eq!(include_close(&mut shim, data), S_OK);
        }
        assert_eq!(resolver.outstanding(), 0);
    }

    #[test]
    fn test_include_shim_defers_fatal_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::source::loader::binary_source_path(dir.path(), "Broken.usf");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [0u8; 3]).unwrap();

        let mut resolver = IncludeResolver::new(Vec::new(), dir.path());
        let mut shim = IncludeShim::new(&mut resolver);
        let name = CString::new("Broken.usf").unwrap();
        let mut data: *const c_void = ptr::null();
        let mut bytes: u32 = 0;
        let hr = unsafe { include_open(&mut shim, 0, name.as_ptr(), ptr::null(), &mut data, &mut bytes) };
        assert_eq!(hr, E_FAIL);
        assert!(resolver.take_error().is_err());
    }

    #[test]
    fn test_include_shim_missing_file() {
        let mut resolver = IncludeResolver::new(Vec::new(), "");
        let mut shim = IncludeShim::new(&mut resolver);
        let name = CString::new("Nowhere.usf").unwrap();
        let mut data: *const c_void = ptr::null();
        let mut bytes: u32 = 0;
        let hr = unsafe { include_open(&mut shim, 0, name.as_ptr(), ptr::null(), &mut data, &mut bytes) };
        assert_eq!(hr, E_FAIL);
        assert!(resolver.take_error().is_ok());
    }
}
