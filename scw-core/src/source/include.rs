//! Include Resolver
//!
//! Capability object handed to the HLSL compilers for `#include` lookups.
//! The parent ships most includes inside the job payload; anything else is
//! read from the precompiled `.bin` sources on disk.
//!
//! # Lookup Order
//! 1. In-memory includes from the payload, by exact name
//! 2. Disk cache of `.bin` files already read by this resolver
//! 3. [`load_shader_source`] under the job's include path
//!
//! Every buffer handed out ends with a NUL byte that is not counted in the
//! reported length. Buffers stay at a stable address until the resolver is
//! dropped, which is what the compiler's open/close callback contract needs.

use super::loader::load_shader_source;
use crate::error::{Result, WorkerError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An include supplied by the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    pub name: String,
    /// Body followed by a NUL terminator.
    body: Vec<u8>,
}

impl Include {
    pub fn new(name: impl Into<String>, body: &[u8]) -> Self {
        let mut terminated: Vec<u8> = Vec::with_capacity(body.len() + 1);
        terminated.extend_from_slice(body);
        terminated.push(0);
        Self {
            name: name.into(),
            body: terminated,
        }
    }

    /// Body without the terminator.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body[..self.body.len() - 1]
    }

    /// Body with the terminator, for C consumers.
    #[inline]
    pub fn body_with_nul(&self) -> &[u8] {
        &self.body
    }
}

/// Resolver for one backend call.
#[derive(Debug)]
pub struct IncludeResolver {
    includes: Vec<Include>,
    include_path: PathBuf,
    disk_cache: HashMap<String, Vec<u8>>,
    /// Addresses handed out by `open` and not yet closed.
    open_handles: Vec<usize>,
    /// First fatal error raised inside a compiler callback.
    deferred_error: Option<WorkerError>,
}

impl IncludeResolver {
    pub fn new(includes: Vec<Include>, include_path: impl Into<PathBuf>) -> Self {
        Self {
            includes,
            include_path: include_path.into(),
            disk_cache: HashMap::new(),
            open_handles: Vec::new(),
            deferred_error: None,
        }
    }

    #[inline]
    pub fn includes(&self) -> &[Include] {
        &self.includes
    }

    #[inline]
    pub fn include_path(&self) -> &Path {
        &self.include_path
    }

    /// Resolve `name`.
    ///
    /// # Returns
    /// The NUL-terminated contents, or `None` so the compiler reports a
    /// missing `#include`. Errors are fatal (a corrupt `.bin` file).
    pub fn open(&mut self, name: &str) -> Result<Option<&[u8]>> {
        let found: Option<&[u8]> = if let Some(index) = self.includes.iter().position(|i| i.name == name) {
            Some(self.includes[index].body_with_nul())
        } else {
            if !self.disk_cache.contains_key(name) {
                match load_shader_source(&self.include_path, name)? {
                    Some(source) => {
                        log::debug!("Include {} resolved from disk", name);
                        self.disk_cache
                            .insert(name.to_string(), source.as_bytes_with_nul().to_vec());
                    }
                    None => {
                        log::debug!("Include {} not found", name);
                        return Ok(None);
                    }
                }
            }
            self.disk_cache.get(name).map(Vec::as_slice)
        };

        if let Some(bytes) = found {
            self.open_handles.push(bytes.as_ptr() as usize);
        }
        Ok(found)
    }

    /// Release a buffer returned by [`IncludeResolver::open`].
    ///
    /// Returns false if `data` was not handed out by this resolver.
    pub fn close(&mut self, data: *const u8) -> bool {
        let address: usize = data as usize;
        match self.open_handles.iter().rposition(|&handle| handle == address) {
            Some(index) => {
                self.open_handles.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of buffers opened and not yet closed.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.open_handles.len()
    }

    /// Keep a fatal error raised where it cannot be returned (inside a C callback).
    pub fn defer_error(&mut self, error: WorkerError) {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(error);
        }
    }

    /// Surface a deferred error once the compiler call has returned.
    pub fn take_error(&mut self) -> Result<()> {
        match self.deferred_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
