//! D3D9 Constant Table Parser
//!
//! Shader model 2/3 bytecode carries its parameter bindings in a `CTAB`
//! comment block right after the version token.
//!
//! # Layout
//! ```text
//! token 0            version (0xFFFEmmnn vertex, 0xFFFFmmnn pixel)
//! comment token      0xFFFE | (lengthInDwords << 16)
//!   fourcc 'CTAB'
//!   header           size, creator, version, constants, constantInfo, flags, target
//!   constantInfo[n]  name, registerSet u16, registerIndex u16, registerCount u16,
//!                    reserved u16, typeInfo, defaultValue
//! ```
//! Offsets inside the table are relative to the first byte after the fourcc.

use crate::error::{Result, WorkerError};

const COMMENT_OPCODE: u32 = 0xFFFE;
const END_TOKEN: u32 = 0x0000_FFFF;
const CTAB_FOURCC: u32 = u32::from_le_bytes(*b"CTAB");
const HEADER_SIZE: usize = 28;
const CONSTANT_INFO_SIZE: usize = 20;

/// `D3DXRS_SAMPLER`.
pub const REGISTER_SET_SAMPLER: u16 = 3;

/// One top-level entry of the constant table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtabConstant {
    /// Name bytes without the terminator.
    pub name: Vec<u8>,
    pub register_set: u16,
    pub register_index: u16,
    pub register_count: u16,
}

impl CtabConstant {
    #[inline]
    pub fn is_sampler(&self) -> bool {
        self.register_set == REGISTER_SET_SAMPLER
    }
}

/// Find and parse the constant table embedded in `bytecode`.
///
/// Bytecode without a table yields an empty list; a table that points
/// outside itself is an error.
pub fn parse_constant_table(bytecode: &[u8]) -> Result<Vec<CtabConstant>> {
    match find_ctab(bytecode) {
        Some(table) => parse_ctab_chunk(table),
        None => Ok(Vec::new()),
    }
}

/// Locate the `CTAB` payload in a shader model 2/3 token stream.
pub fn find_ctab(bytecode: &[u8]) -> Option<&[u8]> {
    let token_count: usize = bytecode.len() / 4;
    let token = |index: usize| -> u32 {
        let at: usize = index * 4;
        u32::from_le_bytes([bytecode[at], bytecode[at + 1], bytecode[at + 2], bytecode[at + 3]])
    };
    if token_count < 2 {
        return None;
    }
    let shader_type: u32 = token(0) >> 16;
    if shader_type != 0xFFFE && shader_type != 0xFFFF {
        return None;
    }

    // Comments precede the first instruction; stop at anything else.
    let mut index: usize = 1;
    while index < token_count {
        let current: u32 = token(index);
        if current == END_TOKEN || current & 0xFFFF != COMMENT_OPCODE {
            return None;
        }
        let length: usize = ((current >> 16) & 0x7FFF) as usize;
        let body_start: usize = index + 1;
        let body_end: usize = body_start + length;
        if body_end > token_count {
            return None;
        }
        if length >= 1 && token(body_start) == CTAB_FOURCC {
            return Some(&bytecode[(body_start + 1) * 4..body_end * 4]);
        }
        index = body_end;
    }
    None
}

/// Parse a `CTAB` payload (the bytes after the fourcc).
pub fn parse_ctab_chunk(table: &[u8]) -> Result<Vec<CtabConstant>> {
    if table.len() < HEADER_SIZE {
        return Err(WorkerError::protocol(format!(
            "Constant table is {} bytes, smaller than its header",
            table.len()
        )));
    }
    let count: usize = read_u32(table, 12)? as usize;
    let info_offset: usize = read_u32(table, 16)? as usize;
    if count > table.len() / CONSTANT_INFO_SIZE {
        return Err(WorkerError::protocol(format!(
            "Constant table claims {} constants in {} bytes",
            count,
            table.len()
        )));
    }

    let mut constants: Vec<CtabConstant> = Vec::with_capacity(count);
    for i in 0..count {
        let entry: usize = info_offset + i * CONSTANT_INFO_SIZE;
        let name_offset: usize = read_u32(table, entry)? as usize;
        constants.push(CtabConstant {
            name: read_cstr(table, name_offset)?.to_vec(),
            register_set: read_u16(table, entry + 4)?,
            register_index: read_u16(table, entry + 6)?,
            register_count: read_u16(table, entry + 8)?,
        });
    }
    Ok(constants)
}

fn read_u32(table: &[u8], offset: usize) -> Result<u32> {
    table
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| WorkerError::protocol(format!("Constant table read at {} out of bounds", offset)))
}

fn read_u16(table: &[u8], offset: usize) -> Result<u16> {
    table
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| WorkerError::protocol(format!("Constant table read at {} out of bounds", offset)))
}

fn read_cstr(table: &[u8], offset: usize) -> Result<&[u8]> {
    let tail: &[u8] = table
        .get(offset..)
        .ok_or_else(|| WorkerError::protocol(format!("Constant name offset {} out of bounds", offset)))?;
    let end: usize = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| WorkerError::protocol("Constant name is not terminated"))?;
    Ok(&tail[..end])
}

/// Size of one [`ConstantDescriptor`] on the wire.
pub const CONSTANT_DESCRIPTOR_SIZE: usize = 268;
/// Room for the name including its terminator.
pub const CONSTANT_NAME_CAPACITY: usize = 256;

/// Fixed-size constant record the parent reads back for D3D9 jobs.
///
/// ```text
/// char name[256]   NUL-terminated, zero-filled
/// u32  isSampler
/// u32  registerIndex
/// u32  registerCount
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantDescriptor {
    name: [u8; CONSTANT_NAME_CAPACITY],
    pub is_sampler: bool,
    pub register_index: u32,
    pub register_count: u32,
}

impl ConstantDescriptor {
    /// Convert a parsed constant. Names that do not fit are fatal.
    #[track_caller]
    pub fn from_constant(constant: &CtabConstant) -> Result<Self> {
        if constant.name.len() >= CONSTANT_NAME_CAPACITY {
            return Err(WorkerError::protocol(format!(
                "Shader constant name {} is {} bytes, limit is {}",
                String::from_utf8_lossy(&constant.name),
                constant.name.len(),
                CONSTANT_NAME_CAPACITY - 1
            )));
        }
        let mut name: [u8; CONSTANT_NAME_CAPACITY] = [0u8; CONSTANT_NAME_CAPACITY];
        name[..constant.name.len()].copy_from_slice(&constant.name);
        Ok(Self {
            name,
            is_sampler: constant.is_sampler(),
            register_index: u32::from(constant.register_index),
            register_count: u32::from(constant.register_count),
        })
    }

    /// Name up to its terminator.
    pub fn name(&self) -> &[u8] {
        let end: usize = self.name.iter().position(|&b| b == 0).unwrap_or(CONSTANT_NAME_CAPACITY);
        &self.name[..end]
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&u32::from(self.is_sampler).to_le_bytes());
        out.extend_from_slice(&self.register_index.to_le_bytes());
        out.extend_from_slice(&self.register_count.to_le_bytes());
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONSTANT_DESCRIPTOR_SIZE {
            return Err(WorkerError::protocol(format!(
                "Constant descriptor needs {} bytes, got {}",
                CONSTANT_DESCRIPTOR_SIZE,
                bytes.len()
            )));
        }
        let mut name: [u8; CONSTANT_NAME_CAPACITY] = [0u8; CONSTANT_NAME_CAPACITY];
        name.copy_from_slice(&bytes[..CONSTANT_NAME_CAPACITY]);
        Ok(Self {
            name,
            is_sampler: read_u32(bytes, 256)? != 0,
            register_index: read_u32(bytes, 260)?,
            register_count: read_u32(bytes, 264)?,
        })
    }
}

/// Parse the table in `bytecode` and encode it as packed descriptors.
pub fn encode_constant_descriptors(bytecode: &[u8]) -> Result<Vec<u8>> {
    let constants: Vec<CtabConstant> = parse_constant_table(bytecode)?;
    let mut out: Vec<u8> = Vec::with_capacity(constants.len() * CONSTANT_DESCRIPTOR_SIZE);
    for constant in &constants {
        ConstantDescriptor::from_constant(constant)?.write(&mut out);
    }
    Ok(out)
}

/// Build a shader model 3 token stream carrying a constant table. Test and tooling helper.
pub fn build_sm3_with_ctab(pixel: bool, constants: &[(&[u8], u16, u16, u16)]) -> Vec<u8> {
    let mut table: Vec<u8> = Vec::new();
    let push = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());

    let info_offset: usize = HEADER_SIZE;
    let mut strings_offset: usize = info_offset + constants.len() * CONSTANT_INFO_SIZE;
    push(&mut table, HEADER_SIZE as u32);
    push(&mut table, 0);
    push(&mut table, if pixel { 0xFFFF_0300 } else { 0xFFFE_0300 });
    push(&mut table, constants.len() as u32);
    push(&mut table, info_offset as u32);
    push(&mut table, 0);
    push(&mut table, 0);

    let mut names: Vec<u8> = Vec::new();
    for (name, set, index, count) in constants {
        push(&mut table, strings_offset as u32);
        table.extend_from_slice(&set.to_le_bytes());
        table.extend_from_slice(&index.to_le_bytes());
        table.extend_from_slice(&count.to_le_bytes());
        table.extend_from_slice(&0u16.to_le_bytes());
        push(&mut table, 0);
        push(&mut table, 0);
        names.extend_from_slice(name);
        names.push(0);
        strings_offset += name.len() + 1;
    }
    table.extend_from_slice(&names);
    while table.len() % 4 != 0 {
        table.push(0);
    }

    let mut out: Vec<u8> = Vec::new();
    push(&mut out, if pixel { 0xFFFF_0300 } else { 0xFFFE_0300 });
    let length: u32 = (table.len() / 4 + 1) as u32;
    push(&mut out, COMMENT_OPCODE | (length << 16));
    push(&mut out, CTAB_FOURCC);
    out.extend_from_slice(&table);
    push(&mut out, END_TOKEN);
    out
}
