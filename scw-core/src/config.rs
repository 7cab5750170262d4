// Worker settings
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the optional settings file next to the worker executable.
pub const CONFIG_FILE_NAME: &str = "ShaderCompileWorker.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Exit after this long without an input file.
    pub idle_timeout_ms: u64,
    /// Sleep between attempts to open the input file.
    pub input_poll_interval_ms: u64,
    /// Attempts to delete a consumed input file.
    pub delete_retry_count: u32,
    pub delete_retry_interval_ms: u64,
    /// Attempts to open the log file or write a materialized include.
    pub file_retry_count: u32,
    pub file_retry_interval_ms: u64,
    /// Pause before exiting on a fatal error so the parent sees the record first.
    pub fatal_exit_delay_ms: u64,
    pub console_bytecode_capacity: usize,
    pub console_constant_capacity: usize,
    pub console_error_capacity: usize,
    /// Library exporting `D3DCompile`/`D3DDisassemble` for D3D9 jobs.
    pub d3d9_compiler_library: String,
    /// Library exporting `D3DCompile` for D3D11 jobs.
    pub d3d11_compiler_library: String,
    /// Overrides the directory that holds the per-platform plugin folders.
    pub plugin_root: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 20_000,
            input_poll_interval_ms: 10,
            delete_retry_count: 20,
            delete_retry_interval_ms: 10,
            file_retry_count: 20,
            file_retry_interval_ms: 100,
            fatal_exit_delay_ms: 100,
            console_bytecode_capacity: 1024 * 1024,
            console_constant_capacity: 256 * 1024,
            console_error_capacity: 256 * 1024,
            d3d9_compiler_library: default_compiler_library(),
            d3d11_compiler_library: default_compiler_library(),
            plugin_root: None,
        }
    }
}

fn default_compiler_library() -> String {
    libloading::library_filename("d3dcompiler_47")
        .to_string_lossy()
        .into_owned()
}

impl WorkerConfig {
    /// Settings file path beside `exe_dir`.
    pub fn config_path(exe_dir: &Path) -> PathBuf {
        exe_dir.join(CONFIG_FILE_NAME)
    }

    /// Load settings from `exe_dir`, falling back to defaults when no file exists.
    pub fn load(exe_dir: &Path) -> Result<Self> {
        let path = Self::config_path(exe_dir);
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: WorkerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.console_bytecode_capacity == 0
            || self.console_constant_capacity == 0
            || self.console_error_capacity == 0
        {
            anyhow::bail!("Console output buffer capacities must be nonzero");
        }
        if self.delete_retry_count == 0 || self.file_retry_count == 0 {
            anyhow::bail!("Retry counts must be at least 1");
        }
        Ok(())
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[inline]
    pub fn input_poll_interval(&self) -> Duration {
        Duration::from_millis(self.input_poll_interval_ms)
    }

    #[inline]
    pub fn delete_retry_interval(&self) -> Duration {
        Duration::from_millis(self.delete_retry_interval_ms)
    }

    #[inline]
    pub fn file_retry_interval(&self) -> Duration {
        Duration::from_millis(self.file_retry_interval_ms)
    }

    #[inline]
    pub fn fatal_exit_delay(&self) -> Duration {
        Duration::from_millis(self.fatal_exit_delay_ms)
    }
}
