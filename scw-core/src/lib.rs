//! Shader Compile Worker Core
//!
//! Library half of the shader compile worker: the batch protocol shared with
//! the parent engine, the compile backends and the dispatcher that ties
//! them together. The `scw-worker` binary adds the process loop, logging and
//! the fatal error channel on top.
//!
//! # Modules
//! - [`protocol`]: job types, primitive codec, batch framing, error records
//! - [`cipher`]: byte obscuring for encrypted payloads and `.bin` sources
//! - [`source`]: `.bin` loader and the per-job include resolver
//! - [`compiler`]: HLSL compiler capability, host `D3DCompile` binding, CTAB parsing
//! - [`plugin`]: console support libraries
//! - [`backend`]: D3D9, D3D11 and console job handlers
//! - [`dispatch`]: batch input to batch output
//! - [`config`]: optional `ShaderCompileWorker.json` settings
//! - [`error`]: fatal error type

pub mod backend;
pub mod cipher;
pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod plugin;
pub mod protocol;
pub mod source;

pub use config::WorkerConfig;
pub use dispatch::{process_batch, WorkerContext};
pub use error::{Result, WorkerError};
pub use protocol::JobType;
