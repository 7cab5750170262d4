//! HLSL Compiler Capability
//!
//! The D3D9 and D3D11 backends talk to the host's HLSL compiler through the
//! [`HlslCompiler`] trait. The production implementation is
//! [`host::HostCompiler`], a dynamically loaded `D3DCompile`; tests supply
//! their own.
//!
//! # Fault Isolation
//! Third-party compilers can fault. Native entry points run inside
//! [`isolate::isolated`], which re-raises access violations and signals as a
//! [`isolate::NativeFault`] unwind. Every call into a compiler goes through
//! [`guarded`], which turns such an unwind, or a panic raised during the
//! call, into `None` so the job fails and the worker keeps running.

pub mod ctab;
pub mod host;
pub mod isolate;

use crate::source::IncludeResolver;
use smallvec::SmallVec;
use std::any::Any;
use std::ffi::{CStr, CString};
use std::panic::{self, AssertUnwindSafe};

/// Generic failure status (`E_FAIL`).
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;

/// Success status (`S_OK`).
pub const S_OK: i32 = 0;

/// Name of the macro flipped to `"0"` when retrying with the legacy compiler.
pub const COMPILER_SUPPORTS_ATTRIBUTES: &str = "COMPILER_SUPPORTS_ATTRIBUTES";

/// `D3DCOMPILE_ENABLE_BACKWARDS_COMPATIBILITY`, set for the legacy retry.
pub const LEGACY_COMPILER_FLAG: u32 = 1 << 12;

/// A preprocessor definition passed to the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderMacro {
    pub name: CString,
    pub definition: CString,
}

impl ShaderMacro {
    pub fn new(name: CString, definition: CString) -> Self {
        Self { name, definition }
    }
}

/// Macro list; most jobs carry a handful of definitions.
pub type MacroList = SmallVec<[ShaderMacro; 8]>;

/// Copy `macros`, forcing `name` to `value` (appending it if absent).
///
/// The original list is left untouched so each compile attempt starts from
/// its own copy.
pub fn with_macro_override(macros: &[ShaderMacro], name: &str, value: &str) -> MacroList {
    let mut list: MacroList = macros.iter().cloned().collect();
    let value: CString = CString::new(value).unwrap_or_default();
    match list.iter_mut().find(|m| m.name.as_bytes() == name.as_bytes()) {
        Some(existing) => existing.definition = value,
        None => {
            if let Ok(name) = CString::new(name) {
                list.push(ShaderMacro::new(name, value));
            }
        }
    }
    list
}

/// One compile call.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    /// Name reported in diagnostics. D3D9 jobs have none.
    pub source_name: Option<&'a CStr>,
    /// HLSL text without a terminator.
    pub source: &'a [u8],
    pub entry_point: &'a CStr,
    pub profile: &'a CStr,
    pub flags: u32,
    pub macros: &'a [ShaderMacro],
}

/// Result of a compile call that returned normally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOutput {
    /// Raw status from the compiler.
    pub hresult: i32,
    pub bytecode: Vec<u8>,
    /// ANSI diagnostics with no terminator.
    pub errors: Vec<u8>,
}

impl CompileOutput {
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.hresult >= 0
    }

    /// Failure record used when the compiler faulted.
    pub fn exception(message: &str) -> Self {
        Self {
            hresult: E_FAIL,
            bytecode: Vec::new(),
            errors: message.as_bytes().to_vec(),
        }
    }

    /// Failed compiles always carry diagnostics and never carry bytecode.
    pub fn normalized(mut self) -> Self {
        if !self.succeeded() {
            self.bytecode.clear();
            if self.errors.is_empty() {
                self.errors = format!("Shader compile failed with HRESULT 0x{:08X}", self.hresult as u32).into_bytes();
            }
        }
        self
    }
}

/// Host HLSL compiler.
pub trait HlslCompiler {
    /// Compile `request`, resolving `#include`s through `includes`.
    ///
    /// Fatal errors hit inside include callbacks are parked on the resolver;
    /// callers check [`IncludeResolver::take_error`] afterwards.
    fn compile(&self, request: &CompileRequest<'_>, includes: &mut IncludeResolver) -> CompileOutput;

    /// Render `bytecode` as text. `None` if the compiler cannot.
    fn disassemble(&self, bytecode: &[u8]) -> Option<Vec<u8>>;
}

/// Run `call`, converting a panic into `None`.
pub fn guarded<T>(what: &str, call: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(value) => Some(value),
        Err(payload) => {
            log::warn!("{} raised an exception: {}", what, panic_message(payload.as_ref()));
            None
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(fault) = payload.downcast_ref::<isolate::NativeFault>() {
        fault.to_string()
    } else {
        "unknown exception".to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Closure-backed compiler for backend and dispatcher tests.

    use super::{CompileOutput, CompileRequest, HlslCompiler};
    use crate::source::IncludeResolver;

    pub struct FnCompiler<C, D> {
        compile: C,
        disassemble: D,
    }

    impl<C, D> FnCompiler<C, D>
    where
        C: Fn(&CompileRequest<'_>, &mut IncludeResolver) -> CompileOutput,
        D: Fn(&[u8]) -> Option<Vec<u8>>,
    {
        pub fn new(compile: C, disassemble: D) -> Self {
            Self { compile, disassemble }
        }
    }

    impl<C, D> HlslCompiler for FnCompiler<C, D>
    where
        C: Fn(&CompileRequest<'_>, &mut IncludeResolver) -> CompileOutput,
        D: Fn(&[u8]) -> Option<Vec<u8>>,
    {
        fn compile(&self, request: &CompileRequest<'_>, includes: &mut IncludeResolver) -> CompileOutput {
            (self.compile)(request, includes)
        }

        fn disassemble(&self, bytecode: &[u8]) -> Option<Vec<u8>> {
            (self.disassemble)(bytecode)
        }
    }

    /// Store to the unmapped first page.
    ///
    /// # Safety
    /// Faults every time; only call it inside a native fault scope.
    pub unsafe fn access_violation() {
        std::ptr::write_volatile(std::hint::black_box(0x10usize) as *mut u32, 0);
    }
}
