//! Shader Compile Worker Process
//!
//! Everything the `ShaderCompileWorker` binary needs around the batch
//! dispatcher in `scw-core`.
//!
//! # Modules
//! - [`worker`]: input polling, exit conditions, consume and reply
//! - [`fatal`]: error record on fatal errors and panics
//! - [`logging`]: stderr and `WorkerLog.txt` logging
//! - [`platform`]: debugger and process queries

pub mod fatal;
pub mod logging;
pub mod platform;
pub mod worker;
