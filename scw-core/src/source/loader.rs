//! Precompiled Shader Source Loader
//!
//! Shader sources that are not shipped in the job payload are read from the
//! engine's `Binaries` folder, where they live as obscured `.bin` files.
//!
//! # File Format
//! - **Header** (24 bytes): `u32 fileVersion` followed by the 20-byte SHA-1 of
//!   the plaintext source. The worker never validates it.
//! - **Body**: the source text, transformed with [`crate::cipher`] using the
//!   body size as the seed size.

use crate::cipher;
use crate::error::{Result, WorkerError};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Size of the header in front of every `.bin` source.
pub const BINARY_SHADER_HEADER_SIZE: usize = 24;
/// Header version written by the engine.
pub const BINARY_SHADER_FILE_VERSION: u32 = 1;

/// Parsed `.bin` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryShaderHeader {
    pub version: u32,
    pub source_hash: [u8; 20],
}

impl BinaryShaderHeader {
    pub fn parse(raw: &[u8; BINARY_SHADER_HEADER_SIZE]) -> Self {
        let mut version_bytes: [u8; 4] = [0u8; 4];
        version_bytes.copy_from_slice(&raw[..4]);
        let mut source_hash: [u8; 20] = [0u8; 20];
        source_hash.copy_from_slice(&raw[4..]);
        Self {
            version: u32::from_le_bytes(version_bytes),
            source_hash,
        }
    }
}

/// Decrypted shader source with a trailing NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBuffer {
    pub header: BinaryShaderHeader,
    bytes: Vec<u8>,
}

impl SourceBuffer {
    /// Source bytes including the trailing NUL.
    #[inline]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.bytes
    }

    /// Source bytes without the trailing NUL.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }

    /// Allocation size, `fileLen - 24 + 1`.
    #[inline]
    pub fn len_with_nul(&self) -> usize {
        self.bytes.len()
    }
}

/// Path of the `.bin` file for `name` under `include_path`.
pub fn binary_source_path(include_path: &Path, name: &str) -> PathBuf {
    include_path
        .join("Binaries")
        .join(Path::new(name).with_extension("bin"))
}

/// Load and decrypt the precompiled source for `name`.
///
/// # Returns
/// `Ok(None)` if the file does not exist. Any other failure to read it is fatal.
pub fn load_shader_source(include_path: &Path, name: &str) -> Result<Option<SourceBuffer>> {
    let path: PathBuf = binary_source_path(include_path, name);
    let mut file: File = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            log::debug!("Couldn't open {}: {}", path.display(), e);
            return Ok(None);
        }
    };

    let file_len: u64 = file
        .metadata()
        .map_err(|e| WorkerError::io(format!("Couldn't stat {}", path.display()), e))?
        .len();
    if file_len < BINARY_SHADER_HEADER_SIZE as u64 {
        return Err(WorkerError::io_message(format!(
            "{} is {} bytes, smaller than its {} byte header",
            path.display(),
            file_len,
            BINARY_SHADER_HEADER_SIZE
        )));
    }

    let mut raw_header: [u8; BINARY_SHADER_HEADER_SIZE] = [0u8; BINARY_SHADER_HEADER_SIZE];
    file.read_exact(&mut raw_header)
        .map_err(|e| WorkerError::io(format!("Couldn't read header of {}", path.display()), e))?;

    let body_len: usize = (file_len - BINARY_SHADER_HEADER_SIZE as u64) as usize;
    let mut bytes: Vec<u8> = vec![0u8; body_len + 1];
    file.read_exact(&mut bytes[..body_len]).map_err(|e| {
        WorkerError::io(
            format!("Short read of {} bytes from {}", body_len, path.display()),
            e,
        )
    })?;
    cipher::transform(&mut bytes[..body_len]);
    bytes[body_len] = 0;

    let header = BinaryShaderHeader::parse(&raw_header);
    if header.version != BINARY_SHADER_FILE_VERSION {
        log::warn!(
            "{} has header version {}, expected {}",
            path.display(),
            header.version,
            BINARY_SHADER_FILE_VERSION
        );
    }
    Ok(Some(SourceBuffer { header, bytes }))
}

/// Write a `.bin` source the way the engine does. Used by tooling and tests.
pub fn write_shader_source(include_path: &Path, name: &str, source: &[u8], source_hash: [u8; 20]) -> std::io::Result<PathBuf> {
    let path: PathBuf = binary_source_path(include_path, name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut contents: Vec<u8> = Vec::with_capacity(BINARY_SHADER_HEADER_SIZE + source.len());
    contents.extend_from_slice(&BINARY_SHADER_FILE_VERSION.to_le_bytes());
    contents.extend_from_slice(&source_hash);
    let mut body: Vec<u8> = source.to_vec();
    cipher::transform(&mut body);
    contents.extend_from_slice(&body);
    std::fs::write(&path, contents)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_replaces_extension() {
        let path = binary_source_path(Path::new("Shaders"), "Common.usf");
        assert_eq!(path, Path::new("Shaders").join("Binaries").join("Common.bin"));
        let bare = binary_source_path(Path::new("Shaders"), "Definitions");
        assert_eq!(bare, Path::new("Shaders").join("Binaries").join("Definitions.bin"));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_shader_source(dir.path(), "Nope.usf").unwrap().is_none());
    }

    #[test]
    fn test_load_decrypts_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let source: &[u8] = b"float4 Common() { return 1; }\n";
        let path = write_shader_source(dir.path(), "Common.usf", source, [7u8; 20]).unwrap();
        let file_len = std::fs::metadata(&path).unwrap().len() as usize;

        let loaded = load_shader_source(dir.path(), "Common.usf").unwrap().unwrap();
        assert_eq!(loaded.len_with_nul(), file_len - BINARY_SHADER_HEADER_SIZE + 1);
        assert_eq!(loaded.as_bytes(), source);
        assert_eq!(*loaded.as_bytes_with_nul().last().unwrap(), 0);
        assert_eq!(loaded.header.version, BINARY_SHADER_FILE_VERSION);
        assert_eq!(loaded.header.source_hash, [7u8; 20]);
    }

    #[test]
    fn test_header_only_file_is_empty_source() {
        let dir = tempfile::tempdir().unwrap();
        write_shader_source(dir.path(), "Empty.usf", b"", [0u8; 20]).unwrap();
        let loaded = load_shader_source(dir.path(), "Empty.usf").unwrap().unwrap();
        assert_eq!(loaded.as_bytes_with_nul(), b"\0");
    }

    #[test]
    fn test_truncated_header_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = binary_source_path(dir.path(), "Short.usf");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [1u8; 10]).unwrap();
        assert!(load_shader_source(dir.path(), "Short.usf").is_err());
    }
}
