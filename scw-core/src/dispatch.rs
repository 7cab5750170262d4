//! Job Dispatcher
//!
//! Turns one batch input file into one batch output buffer.
//!
//! # Algorithm
//! For each batch entry, in input order:
//! 1. Write the job id to the output.
//! 2. Read the payload, decrypting it in place if flagged.
//! 3. Read `u32 jobType` and `u8 inputVersion`.
//! 4. Hand the rest of the payload to the backend for that job type.
//!
//! Any error aborts the whole batch. The caller turns it into the error
//! record, tagged with [`WorkerContext::job_in_flight`].

use crate::backend::console::{compile_console_shader, ConsoleEnvironment};
use crate::backend::d3d11::compile_d3d11_shader;
use crate::backend::d3d9::compile_d3d9_shader;
use crate::compiler::host::HostCompiler;
use crate::compiler::HlslCompiler;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::plugin::{PluginCache, PrecompilerProvider};
use crate::protocol::batch::{begin_output, read_input_header, read_job_id, read_job_payload};
use crate::protocol::codec::{write_value, ByteReader};
use crate::protocol::JobType;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Creates the HLSL compiler for a D3D job type on first use.
pub type CompilerFactory = Box<dyn FnMut(JobType, &WorkerConfig) -> Result<Box<dyn HlslCompiler>>>;

/// Load the host compiler library configured for `job_type`.
pub fn load_host_compiler(job_type: JobType, config: &WorkerConfig) -> Result<Box<dyn HlslCompiler>> {
    let library: &str = match job_type {
        JobType::D3D9Shader => &config.d3d9_compiler_library,
        JobType::D3D11Shader => &config.d3d11_compiler_library,
        other => {
            return Err(WorkerError::protocol(format!(
                "{:?} jobs do not use the HLSL compiler",
                other
            )))
        }
    };
    Ok(Box::new(HostCompiler::load(library)?))
}

/// Process-wide worker state shared by every batch.
pub struct WorkerContext {
    pub config: WorkerConfig,
    /// Scratch directory shared with the parent.
    pub working_dir: PathBuf,
    /// Job id of the entry being processed, 0 outside a batch entry.
    pub job_in_flight: i32,
    compilers: HashMap<JobType, Box<dyn HlslCompiler>>,
    compiler_factory: CompilerFactory,
    plugins: Box<dyn PrecompilerProvider>,
}

impl WorkerContext {
    /// Context backed by the host compiler library and the console plugins
    /// found relative to `exe_dir`.
    pub fn new(config: WorkerConfig, exe_dir: &Path, working_dir: impl Into<PathBuf>) -> Self {
        let plugin_root: PathBuf = config
            .plugin_root
            .clone()
            .unwrap_or_else(|| exe_dir.join(".."));
        Self::with_backends(
            config,
            working_dir,
            Box::new(load_host_compiler),
            Box::new(PluginCache::new(plugin_root)),
        )
    }

    /// Context with caller-supplied compiler and plugin sources.
    pub fn with_backends(
        config: WorkerConfig,
        working_dir: impl Into<PathBuf>,
        compiler_factory: CompilerFactory,
        plugins: Box<dyn PrecompilerProvider>,
    ) -> Self {
        Self {
            config,
            working_dir: working_dir.into(),
            job_in_flight: 0,
            compilers: HashMap::new(),
            compiler_factory,
            plugins,
        }
    }

    /// Cached HLSL compiler for `job_type`, created on first use.
    fn compiler(&mut self, job_type: JobType) -> Result<&dyn HlslCompiler> {
        if !self.compilers.contains_key(&job_type) {
            let compiler: Box<dyn HlslCompiler> = (self.compiler_factory)(job_type, &self.config)?;
            self.compilers.insert(job_type, compiler);
        }
        self.compilers
            .get(&job_type)
            .map(|compiler| &**compiler)
            .ok_or_else(|| WorkerError::plugin(format!("No HLSL compiler for {:?}", job_type)))
    }

    /// Run one job payload, appending its record to `out`.
    fn process_job(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut reader: ByteReader<'_> = ByteReader::new(payload);
        let job_type: JobType = JobType::from_raw(reader.read_value()?)?;
        let input_version: u8 = reader.read_value()?;

        match job_type {
            JobType::D3D9Shader => {
                let compiler: &dyn HlslCompiler = self.compiler(job_type)?;
                compile_d3d9_shader(input_version, &mut reader, compiler, out)
            }
            JobType::D3D11Shader => {
                let compiler: &dyn HlslCompiler = self.compiler(job_type)?;
                compile_d3d11_shader(input_version, &mut reader, compiler, out)
            }
            JobType::XenonShader | JobType::Ps3Shader | JobType::WiiUShader => {
                let env: ConsoleEnvironment<'_> = ConsoleEnvironment {
                    working_dir: &self.working_dir,
                    config: &self.config,
                };
                compile_console_shader(job_type, input_version, &mut reader, &mut *self.plugins, &env, out)
            }
            JobType::WorkerError => Err(WorkerError::protocol(
                "WorkerError is an output-only job type and cannot be compiled",
            )),
        }
    }
}

/// Process a whole batch input file.
///
/// # Returns
/// The complete output file contents, one record per job in input order.
pub fn process_batch(input: &[u8], ctx: &mut WorkerContext) -> Result<Vec<u8>> {
    let mut reader: ByteReader<'_> = ByteReader::new(input);
    ctx.job_in_flight = 0;
    let num_batches: i32 = read_input_header(&mut reader)?;
    log::info!("Processing {} batched jobs", num_batches);

    let mut out: Vec<u8> = begin_output(num_batches);
    for _ in 0..num_batches {
        let job_id: i32 = read_job_id(&mut reader)?;
        ctx.job_in_flight = job_id;
        write_value(&mut out, job_id);
        let payload: Vec<u8> = read_job_payload(&mut reader)?;
        ctx.process_job(&payload, &mut out)?;
    }
    ctx.job_in_flight = 0;
    Ok(out)
}
