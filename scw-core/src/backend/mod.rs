//! Compile Backends
//!
//! One module per job family. Each backend reads its payload (everything
//! after `u32 jobType, u8 inputVersion`) and appends exactly one record to
//! the batch output.
//!
//! # Shared Payload Pieces
//! - **Include list**: `u32 numIncludes`, then `numIncludes x (ansi name, ansi body)`
//! - **Macro list**: `u32 numMacros`, then `numMacros x (ansi name, ansi definition)`

pub mod console;
pub mod d3d11;
pub mod d3d9;

use crate::compiler::{MacroList, ShaderMacro};
use crate::error::{ensure, Result};
use crate::protocol::codec::ByteReader;
use crate::source::Include;

/// Expected `inputVersion` of D3D9 jobs.
pub const D3D9_INPUT_VERSION: u8 = 0;
/// Expected `inputVersion` of D3D11 jobs.
pub const D3D11_INPUT_VERSION: u8 = 0;
/// Expected `inputVersion` of console jobs.
pub const CONSOLE_INPUT_VERSION: u8 = 2;

/// Read an include list.
#[track_caller]
pub fn read_includes(reader: &mut ByteReader<'_>) -> Result<Vec<Include>> {
    let count: usize = reader.read_length()?;
    // Each entry is at least two length prefixes.
    ensure(count <= reader.remaining() / 8, || {
        format!("Include count {} exceeds remaining payload", count)
    })?;
    let mut includes: Vec<Include> = Vec::with_capacity(count);
    for _ in 0..count {
        let name: String = reader.parse_ansi_string()?;
        let body: &[u8] = reader.read_ansi_bytes()?;
        includes.push(Include::new(name, body));
    }
    Ok(includes)
}

/// Read a macro list.
#[track_caller]
pub fn read_macros(reader: &mut ByteReader<'_>) -> Result<MacroList> {
    let count: usize = reader.read_length()?;
    ensure(count <= reader.remaining() / 8, || {
        format!("Macro count {} exceeds remaining payload", count)
    })?;
    let mut macros: MacroList = MacroList::with_capacity(count);
    for _ in 0..count {
        let name = reader.parse_ansi_cstring()?;
        let definition = reader.parse_ansi_cstring()?;
        macros.push(ShaderMacro::new(name, definition));
    }
    Ok(macros)
}

/// Fail unless a job's `inputVersion` matches what its backend reads.
#[track_caller]
pub fn check_input_version(backend: &str, found: u8, expected: u8) -> Result<()> {
    ensure(found == expected, || {
        format!(
            "{} job input version {} does not match expected {}",
            backend, found, expected
        )
    })
}

#[cfg(test)]
pub(crate) mod payload {
    //! Payload builders shared by the backend tests.

    use crate::protocol::codec::{write_ansi_string, write_value};

    pub fn write_includes(out: &mut Vec<u8>, includes: &[(&str, &str)]) {
        write_value(out, includes.len() as u32);
        for (name, body) in includes {
            write_ansi_string(out, name.as_bytes());
            write_ansi_string(out, body.as_bytes());
        }
    }

    pub fn write_macros(out: &mut Vec<u8>, macros: &[(&str, &str)]) {
        write_value(out, macros.len() as u32);
        for (name, definition) in macros {
            write_ansi_string(out, name.as_bytes());
            write_ansi_string(out, definition.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::payload::{write_includes, write_macros};
    use super::*;

    #[test]
    fn test_read_includes_and_macros() {
        let mut buf: Vec<u8> = Vec::new();
        write_includes(&mut buf, &[("Material.usf", "#define M 1"), ("VertexFactory.usf", "")]);
        write_macros(&mut buf, &[("SM3_PROFILE", "1")]);

        let mut reader = ByteReader::new(&buf);
        let includes = read_includes(&mut reader).unwrap();
        assert_eq!(includes.len(), 2);
        assert_eq!(includes[0].name, "Material.usf");
        assert_eq!(includes[0].body(), b"#define M 1");
        assert_eq!(includes[1].body(), b"");

        let macros = read_macros(&mut reader).unwrap();
        assert_eq!(macros.len(), 1);
        assert_eq!(macros[0].name.as_bytes(), b"SM3_PROFILE");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_absurd_include_count() {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut reader = ByteReader::new(&buf);
        assert!(read_includes(&mut reader).is_err());
    }

    #[test]
    fn test_version_check() {
        assert!(check_input_version("D3D9", 0, D3D9_INPUT_VERSION).is_ok());
        let err = check_input_version("Console", 1, CONSOLE_INPUT_VERSION).unwrap_err();
        assert!(err.message().contains("input version 1"));
    }
}
