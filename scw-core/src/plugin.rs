//! Console Support Plugins
//!
//! Console shader jobs are compiled by per-platform tool libraries that the
//! worker loads on first use and keeps for the rest of the process.
//!
//! # Library Requirements
//! Each library exports `GetConsoleSupport(module) -> *mut ConsoleSupport`.
//! The returned object and the precompiler it hands out are C vtables:
//!
//! ```text
//! ConsoleSupport      { vtbl -> { initialize(this, gameName, configuration),
//!                                 get_global_shader_precompiler(this) } }
//! ShaderPrecompiler   { vtbl -> { precompile_shader(this, ...) -> bool } }
//! ```
//!
//! Wide strings are NUL-terminated UTF-16.
//!
//! # Location
//! `<root>/<Platform>/<Platform>Tools[_x64].<dll extension>`, where `<root>`
//! is the directory above the worker executable unless configured otherwise.

use crate::compiler::isolate::{isolated, Transfer};
use crate::error::{ensure, Result, WorkerError};
use crate::protocol::codec::{write_blob, write_value, ByteReader};
use crate::protocol::JobType;
use libloading::Library;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

/// Message every plugin load failure starts with.
pub const LOAD_FAILURE_MESSAGE: &str = "Failed to load console support dll";

/// Build configuration reported to plugins.
pub const BUILD_FLAVOR: &str = if cfg!(debug_assertions) { "Debug" } else { "Release" };

/// Arguments of one console precompile.
#[derive(Debug, Clone, Copy)]
pub struct PrecompileRequest<'a> {
    /// Source name, or a materialized file path for plugins that need one.
    pub shader_path: &'a CStr,
    pub entry_function: &'a CStr,
    pub is_vertex_shader: bool,
    pub compile_flags: u32,
    /// Space separated `NAME=VALUE` definitions.
    pub definitions: &'a CStr,
    pub include_directory: &'a CStr,
    pub include_names: &'a [&'a CStr],
    pub include_contents: &'a [&'a CStr],
    pub dump_pdbs: bool,
    pub pdb_path: &'a CStr,
}

/// Caller-owned output buffers, zero-filled before every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompileBuffers {
    pub bytecode: Vec<u8>,
    /// Bytes of `bytecode` the plugin filled in.
    pub bytecode_size: i32,
    /// NUL-terminated `Name,RegisterIndex,RegisterCount` list.
    pub constants: Vec<u8>,
    /// NUL-terminated diagnostics.
    pub errors: Vec<u8>,
}

impl PrecompileBuffers {
    pub fn new(bytecode_capacity: usize, constant_capacity: usize, error_capacity: usize) -> Self {
        Self {
            bytecode: vec![0u8; bytecode_capacity],
            bytecode_size: 0,
            constants: vec![0u8; constant_capacity],
            errors: vec![0u8; error_capacity],
        }
    }

    /// Bytecode the plugin reported, bounds-checked against the buffer.
    pub fn bytecode(&self) -> Result<&[u8]> {
        match usize::try_from(self.bytecode_size) {
            Ok(size) if size <= self.bytecode.len() => Ok(&self.bytecode[..size]),
            _ => Err(WorkerError::plugin(format!(
                "Console precompiler reported {} bytes of bytecode in a {} byte buffer",
                self.bytecode_size,
                self.bytecode.len()
            ))),
        }
    }

    /// Constant text up to its terminator.
    pub fn constants(&self) -> &[u8] {
        until_nul(&self.constants)
    }

    /// Error text up to its terminator.
    pub fn errors(&self) -> &[u8] {
        until_nul(&self.errors)
    }
}

/// Capacities, the reported size and the filled prefixes.
impl Transfer for PrecompileBuffers {
    fn encode(&self, out: &mut Vec<u8>) {
        write_value(out, self.bytecode.len() as u32);
        write_value(out, self.constants.len() as u32);
        write_value(out, self.errors.len() as u32);
        write_value(out, self.bytecode_size);
        let filled: usize = usize::try_from(self.bytecode_size).map_or(0, |size| size.min(self.bytecode.len()));
        write_blob(out, &self.bytecode[..filled]);
        write_blob(out, self.constants());
        write_blob(out, self.errors());
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let bytecode_capacity: usize = reader.read_length()?;
        let constant_capacity: usize = reader.read_length()?;
        let error_capacity: usize = reader.read_length()?;
        let mut buffers: Self = Self::new(bytecode_capacity, constant_capacity, error_capacity);
        buffers.bytecode_size = reader.read_value()?;
        for target in [&mut buffers.bytecode, &mut buffers.constants, &mut buffers.errors] {
            let filled: &[u8] = reader.read_ansi_bytes()?;
            ensure(filled.len() <= target.len(), || {
                format!("{} filled bytes exceed a {} byte buffer", filled.len(), target.len())
            })?;
            target[..filled.len()].copy_from_slice(filled);
        }
        Ok(buffers)
    }
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let end: usize = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// A platform's global shader precompiler.
pub trait ShaderPrecompiler {
    /// Compile one shader into `buffers`. Returns true on success.
    fn precompile_shader(&self, request: &PrecompileRequest<'_>, buffers: &mut PrecompileBuffers) -> bool;
}

/// Source of initialized precompilers, one per console job type.
pub trait PrecompilerProvider {
    /// Precompiler for `job_type`, loading and initializing its plugin with
    /// `game_name` the first time.
    fn precompiler(&mut self, job_type: JobType, game_name: &[u16]) -> Result<&dyn ShaderPrecompiler>;
}

/// Platform folder and library stem for a console job type.
pub fn platform_name(job_type: JobType) -> Option<&'static str> {
    match job_type {
        JobType::XenonShader => Some("Xbox360"),
        JobType::Ps3Shader => Some("PS3"),
        JobType::WiiUShader => Some("WiiU"),
        _ => None,
    }
}

/// Path of the plugin library for `job_type` under `root`.
pub fn plugin_path(root: &Path, job_type: JobType) -> Option<PathBuf> {
    let platform: &str = platform_name(job_type)?;
    let suffix: &str = if cfg!(target_pointer_width = "64") { "_x64" } else { "" };
    let file_name: String = format!("{}Tools{}.{}", platform, suffix, std::env::consts::DLL_EXTENSION);
    Some(root.join(platform).join(file_name))
}

type GetConsoleSupportFn = unsafe extern "C" fn(module: *mut c_void) -> *mut RawConsoleSupport;

#[repr(C)]
struct ConsoleSupportVtbl {
    initialize: unsafe extern "C" fn(this: *mut RawConsoleSupport, game_name: *const u16, configuration: *const u16),
    get_global_shader_precompiler: unsafe extern "C" fn(this: *mut RawConsoleSupport) -> *mut RawShaderPrecompiler,
}

#[repr(C)]
struct RawConsoleSupport {
    vtbl: *const ConsoleSupportVtbl,
}

#[repr(C)]
struct ShaderPrecompilerVtbl {
    precompile_shader: unsafe extern "C" fn(
        this: *mut RawShaderPrecompiler,
        shader_path: *const c_char,
        entry_function: *const c_char,
        is_vertex_shader: bool,
        compile_flags: u32,
        definitions: *const c_char,
        include_directory: *const c_char,
        include_file_names: *const *const c_char,
        include_file_contents: *const *const c_char,
        num_includes: i32,
        dump_pdbs: bool,
        pdb_path: *const c_char,
        bytecode: *mut u8,
        bytecode_size: *mut i32,
        constant_buffer: *mut c_char,
        errors: *mut c_char,
    ) -> bool,
}

#[repr(C)]
struct RawShaderPrecompiler {
    vtbl: *const ShaderPrecompilerVtbl,
}

/// Precompiler living inside a loaded plugin library.
pub struct NativePrecompiler {
    raw: NonNull<RawShaderPrecompiler>,
}

/// One raw `PrecompileShader` call.
///
/// # Safety
/// `raw` must point at a live precompiler with the documented vtable.
unsafe fn call_precompile(
    raw: NonNull<RawShaderPrecompiler>,
    request: &PrecompileRequest<'_>,
    buffers: &mut PrecompileBuffers,
) -> bool {
    let names: Vec<*const c_char> = request.include_names.iter().map(|n| n.as_ptr()).collect();
    let contents: Vec<*const c_char> = request.include_contents.iter().map(|c| c.as_ptr()).collect();
    let (names_ptr, contents_ptr) = if names.is_empty() {
        (ptr::null(), ptr::null())
    } else {
        (names.as_ptr(), contents.as_ptr())
    };
    let this: *mut RawShaderPrecompiler = raw.as_ptr();
    ((*(*this).vtbl).precompile_shader)(
        this,
        request.shader_path.as_ptr(),
        request.entry_function.as_ptr(),
        request.is_vertex_shader,
        request.compile_flags,
        request.definitions.as_ptr(),
        request.include_directory.as_ptr(),
        names_ptr,
        contents_ptr,
        names.len() as i32,
        request.dump_pdbs,
        request.pdb_path.as_ptr(),
        buffers.bytecode.as_mut_ptr(),
        &mut buffers.bytecode_size,
        buffers.constants.as_mut_ptr() as *mut c_char,
        buffers.errors.as_mut_ptr() as *mut c_char,
    )
}

impl ShaderPrecompiler for NativePrecompiler {
    fn precompile_shader(&self, request: &PrecompileRequest<'_>, buffers: &mut PrecompileBuffers) -> bool {
        let raw: NonNull<RawShaderPrecompiler> = self.raw;
        let (success, filled): (bool, PrecompileBuffers) = isolated("PrecompileShader", || {
            let success: bool = unsafe { call_precompile(raw, request, buffers) };
            (success, std::mem::replace(buffers, PrecompileBuffers::new(0, 0, 0)))
        });
        *buffers = filled;
        success
    }
}

/// Split `library` into the OS module handle and a library that still owns it.
fn module_handle(library: Library) -> (Library, *mut c_void) {
    #[cfg(unix)]
    let (library, handle) = {
        let raw = libloading::os::unix::Library::from(library).into_raw();
        (Library::from(unsafe { libloading::os::unix::Library::from_raw(raw) }), raw)
    };
    #[cfg(windows)]
    let (library, handle) = {
        let raw = libloading::os::windows::Library::from(library).into_raw();
        (Library::from(unsafe { libloading::os::windows::Library::from_raw(raw) }), raw as *mut c_void)
    };
    (library, handle)
}

/// A loaded, initialized plugin.
pub struct LoadedPlugin {
    pub path: PathBuf,
    precompiler: NativePrecompiler,
    _support: NonNull<RawConsoleSupport>,
    /// Never unloaded; dropping it would invalidate the vtables.
    _library: Library,
}

impl LoadedPlugin {
    /// Load the library at `path`, initialize it and fetch its global precompiler.
    ///
    /// # Safety
    /// Runs the library's initializers and trusts its exports to match the
    /// layout described in the module docs.
    pub unsafe fn load(path: &Path, game_name: &[u16]) -> Result<Self> {
        log::info!("Loading console support from {}", path.display());
        let library: Library = Library::new(path)
            .map_err(|e| WorkerError::plugin(format!("{} {}: {}", LOAD_FAILURE_MESSAGE, path.display(), e)))?;
        let (library, module): (Library, *mut c_void) = module_handle(library);
        let get_console_support: GetConsoleSupportFn = *library
            .get::<GetConsoleSupportFn>(b"GetConsoleSupport\0")
            .map_err(|e| WorkerError::plugin(format!("{} {}: {}", LOAD_FAILURE_MESSAGE, path.display(), e)))?;

        let support: NonNull<RawConsoleSupport> = NonNull::new(get_console_support(module))
            .ok_or_else(|| WorkerError::plugin(format!("{} {}: GetConsoleSupport returned null", LOAD_FAILURE_MESSAGE, path.display())))?;

        let mut wide_game_name: Vec<u16> = game_name.to_vec();
        wide_game_name.push(0);
        let mut flavor: Vec<u16> = BUILD_FLAVOR.encode_utf16().collect();
        flavor.push(0);

        let this: *mut RawConsoleSupport = support.as_ptr();
        ((*(*this).vtbl).initialize)(this, wide_game_name.as_ptr(), flavor.as_ptr());
        let precompiler: NonNull<RawShaderPrecompiler> = NonNull::new(((*(*this).vtbl).get_global_shader_precompiler)(this))
            .ok_or_else(|| WorkerError::plugin(format!("{} has no global shader precompiler", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
            precompiler: NativePrecompiler { raw: precompiler },
            _support: support,
            _library: library,
        })
    }
}

/// Lazily populated plugin cache keyed by job type.
pub struct PluginCache {
    root: PathBuf,
    plugins: HashMap<JobType, LoadedPlugin>,
}

impl PluginCache {
    /// `root` holds the per-platform plugin folders.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            plugins: HashMap::new(),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of plugins loaded so far.
    #[inline]
    pub fn loaded(&self) -> usize {
        self.plugins.len()
    }
}

impl PrecompilerProvider for PluginCache {
    fn precompiler(&mut self, job_type: JobType, game_name: &[u16]) -> Result<&dyn ShaderPrecompiler> {
        if !self.plugins.contains_key(&job_type) {
            let path: PathBuf = plugin_path(&self.root, job_type).ok_or_else(|| {
                WorkerError::protocol(format!("{:?} jobs are not compiled by a console plugin", job_type))
            })?;
            let plugin: LoadedPlugin = unsafe { LoadedPlugin::load(&path, game_name)? };
            self.plugins.insert(job_type, plugin);
        }
        self.plugins
            .get(&job_type)
            .map(|plugin| &plugin.precompiler as &dyn ShaderPrecompiler)
            .ok_or_else(|| WorkerError::plugin(LOAD_FAILURE_MESSAGE))
    }
}
