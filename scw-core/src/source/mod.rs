//! Shader source access: the on-disk `.bin` loader and the per-job include resolver.

pub mod include;
pub mod loader;

pub use include::{Include, IncludeResolver};
pub use loader::{load_shader_source, SourceBuffer};
