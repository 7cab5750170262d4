//! Obscurity Cipher
//!
//! Symmetric XOR transform shared with the parent engine. It protects the
//! per-job payloads in the batch input file and the precompiled shader
//! sources under `Binaries/`.
//!
//! This is a compatibility boundary, not a cryptographic one: the key table
//! and the size-dependent seed must match the parent bit-exactly.
//!
//! # Algorithm
//! For a buffer of `size` bytes, byte `i` is XORed with
//! `KEY[(seed + i) % KEY_LENGTH]` where
//! `seed = (240169 + 244109 * size) mod 2^32`.
//!
//! Because the seed depends on the size, every logical unit (a job payload,
//! a shader source file) must be transformed on its own.

/// Length of the key table.
pub const KEY_LENGTH: usize = 761;

const SEED_BASE: u32 = 240_169;
const SEED_SCALE: u32 = 244_109;

#[rustfmt::skip]
static KEY: [u8; KEY_LENGTH] = [
    0xAD, 0x50, 0x3B, 0x59, 0x5A, 0x5D, 0x33, 0x5C, 0xEA, 0xA6, 0x58, 0xA7, 0xED, 0x28, 0xF4, 0x90,
    0x9B, 0x6F, 0x60, 0x70, 0x50, 0x30, 0x3E, 0x5E, 0x0F, 0x3A, 0xB6, 0xC4, 0xEE, 0x91, 0xF7, 0x2F,
    0x6D, 0xEE, 0x6F, 0xAE, 0x2D, 0x9E, 0x6F, 0x20, 0x94, 0x6D, 0x7A, 0x6B, 0x21, 0x88, 0xD4, 0xF8,
    0xAE, 0x74, 0xDF, 0x08, 0x31, 0x2A, 0xEE, 0x9D, 0xA3, 0x33, 0xB7, 0x57, 0x60, 0xB0, 0x60, 0xD5,
    0x88, 0x4B, 0x07, 0xC4, 0xFB, 0x02, 0x42, 0x84, 0x02, 0x74, 0xA6, 0x6A, 0x45, 0x70, 0x65, 0x7D,
    0xA5, 0xDB, 0x4F, 0x8B, 0xF3, 0xF4, 0x95, 0x8B, 0xFF, 0xF8, 0x75, 0x86, 0xB0, 0x8F, 0xFF, 0x4D,
    0xDC, 0xE7, 0xC2, 0xF1, 0xF2, 0x53, 0xCA, 0xDF, 0x0B, 0x6B, 0x80, 0x5C, 0xF8, 0x97, 0x6F, 0x67,
    0x33, 0x98, 0xD5, 0xE3, 0x06, 0x50, 0x95, 0x53, 0xF1, 0x16, 0x4A, 0xAA, 0xC7, 0x3D, 0x94, 0x48,
    0x7F, 0xAE, 0xAE, 0x40, 0x98, 0x5D, 0x22, 0x57, 0xB7, 0xB7, 0xE6, 0x83, 0x21, 0x3F, 0xD5, 0xF3,
    0xDD, 0x8C, 0x28, 0x01, 0xBC, 0xFC, 0x62, 0xDF, 0x93, 0x14, 0x86, 0x6C, 0xF2, 0xC4, 0x29, 0xEC,
    0x4C, 0x9A, 0x24, 0x7B, 0x2F, 0x19, 0xAD, 0x0C, 0x62, 0x9B, 0x0F, 0x36, 0xC5, 0x0E, 0x4C, 0xDF,
    0xA1, 0xA8, 0x55, 0xAB, 0x81, 0x06, 0x07, 0x43, 0x69, 0xD7, 0x2D, 0x9F, 0x7C, 0x83, 0xD0, 0x7B,
    0xB5, 0x92, 0xE9, 0xB2, 0x3E, 0x40, 0xED, 0xB5, 0x72, 0xB4, 0x16, 0x4E, 0x7C, 0x6F, 0xD7, 0x3F,
    0x00, 0xD1, 0x4F, 0x65, 0x63, 0x4A, 0x9F, 0xB9, 0x2B, 0x50, 0x99, 0x5F, 0x65, 0x66, 0xFF, 0x1B,
    0x8B, 0x07, 0x4A, 0x9E, 0xEC, 0x66, 0x4B, 0xEB, 0xCB, 0x25, 0x14, 0xDD, 0xC7, 0x79, 0xAE, 0x5B,
    0xC8, 0xA0, 0x85, 0x8E, 0x1E, 0x62, 0x17, 0xD6, 0x19, 0x5C, 0xC0, 0x1B, 0x0E, 0xD8, 0x3A, 0xDC,
    0x57, 0xB8, 0xC0, 0x8E, 0xB8, 0x97, 0x9E, 0x21, 0x14, 0x19, 0x9C, 0x27, 0xC5, 0x30, 0x54, 0x87,
    0x5B, 0xB3, 0x3C, 0x86, 0xB8, 0x4F, 0x94, 0xD1, 0xAE, 0x16, 0x03, 0x7B, 0xC1, 0x34, 0x9F, 0x91,
    0xC6, 0x3B, 0xA4, 0x1B, 0x1C, 0x17, 0x3F, 0x98, 0xBD, 0xC8, 0x17, 0xE9, 0x2A, 0x3D, 0x96, 0x54,
    0x53, 0x40, 0xBE, 0x26, 0x2D, 0xE2, 0x59, 0x2A, 0x1A, 0x80, 0xD0, 0x5C, 0xDE, 0xBC, 0xBC, 0x0C,
    0x62, 0x08, 0x5A, 0xB5, 0xE8, 0xC3, 0x11, 0xF5, 0xA3, 0xFA, 0xE3, 0x7E, 0xB9, 0x80, 0x00, 0xA1,
    0xC7, 0x26, 0x0C, 0x1B, 0xF7, 0xB5, 0x13, 0xE4, 0xDD, 0x2A, 0x43, 0x81, 0x23, 0xE8, 0x85, 0x5D,
    0x53, 0xE1, 0x30, 0xEB, 0x61, 0x86, 0x4F, 0xB7, 0x72, 0x46, 0xA6, 0x84, 0x57, 0x63, 0x8E, 0xAE,
    0x07, 0xD2, 0xE6, 0x3E, 0xA9, 0x83, 0x3C, 0x9E, 0x81, 0x3B, 0x52, 0x45, 0x6A, 0xC4, 0x63, 0x0A,
    0x04, 0xAB, 0xEB, 0xD5, 0x50, 0x13, 0x85, 0x95, 0x64, 0x3E, 0xFA, 0x2D, 0x52, 0x5F, 0x8B, 0xB4,
    0x3B, 0x88, 0xD3, 0xD4, 0x5B, 0x7B, 0x52, 0x77, 0xD1, 0x04, 0x7B, 0xBD, 0x41, 0x1B, 0xE9, 0x8D,
    0x70, 0x22, 0x60, 0x80, 0x47, 0xD3, 0x92, 0x8C, 0x55, 0xBB, 0xFD, 0x7C, 0x1B, 0x29, 0x1D, 0x6D,
    0x15, 0x43, 0x3B, 0xE5, 0x69, 0x7E, 0x1E, 0x3B, 0x80, 0x7D, 0xEC, 0x33, 0x28, 0x3D, 0x5B, 0x6F,
    0xD6, 0xF2, 0x06, 0xC2, 0xF3, 0x52, 0xC2, 0x88, 0x90, 0x25, 0x86, 0x84, 0xCF, 0x72, 0xCF, 0xB7,
    0xAB, 0xEC, 0x9E, 0xE4, 0xD9, 0x21, 0x70, 0x6D, 0x53, 0xCF, 0xDC, 0xB9, 0xA1, 0x38, 0x92, 0x75,
    0x94, 0xFA, 0x08, 0x70, 0xA6, 0xC4, 0x85, 0x6C, 0xCE, 0x3D, 0xFD, 0x7F, 0x4C, 0x5B, 0xD6, 0x47,
    0x53, 0xA5, 0xF8, 0x49, 0xE8, 0x79, 0xF3, 0xA8, 0xD2, 0x45, 0xEF, 0x1C, 0x78, 0xA7, 0xE2, 0x6E,
    0x26, 0x48, 0xCF, 0x2A, 0xBD, 0xBE, 0x2F, 0xDA, 0xDE, 0xE4, 0x5E, 0x4F, 0x5E, 0x8F, 0xB2, 0x02,
    0xD7, 0xEB, 0xF0, 0x28, 0xDB, 0xB9, 0x69, 0xA2, 0xD2, 0xA1, 0x7A, 0x08, 0x08, 0x48, 0xB5, 0x36,
    0x02, 0x67, 0x31, 0x9F, 0xCD, 0xCB, 0xF3, 0xE5, 0x0B, 0xFF, 0xAE, 0xFB, 0xB5, 0xC4, 0x69, 0xB1,
    0xC8, 0xFE, 0xE3, 0xE6, 0x42, 0x9F, 0xF4, 0x86, 0xDD, 0xDF, 0x43, 0xC2, 0xF7, 0x67, 0xCB, 0x08,
    0xB1, 0xD6, 0x59, 0x08, 0xE1, 0xB2, 0x28, 0xC3, 0x93, 0xE7, 0x5E, 0x06, 0x5F, 0xF7, 0x2F, 0x29,
    0xBA, 0x3A, 0xAD, 0x54, 0x15, 0x03, 0x86, 0x9F, 0xC8, 0xC7, 0xE3, 0x82, 0xA7, 0xFB, 0xFD, 0x5D,
    0xA7, 0xE6, 0xA1, 0xBC, 0x3A, 0x79, 0xFD, 0x8B, 0x29, 0x2D, 0x1C, 0x46, 0x2F, 0x22, 0x07, 0xC3,
    0xEA, 0x39, 0xAC, 0x5C, 0x3D, 0xDA, 0xE5, 0x10, 0x6A, 0xF0, 0x22, 0x76, 0xC5, 0x04, 0x0F, 0x4A,
    0x68, 0xE9, 0x95, 0x37, 0xE6, 0x17, 0x0D, 0x53, 0x25, 0x46, 0x50, 0x4C, 0xD9, 0x98, 0x16, 0xC6,
    0x8A, 0xE1, 0x34, 0x69, 0xD8, 0xD7, 0x73, 0xAA, 0x9C, 0x53, 0x64, 0xE8, 0x77, 0x2B, 0xD5, 0xF8,
    0x3E, 0xAB, 0x1C, 0x97, 0x49, 0x97, 0x39, 0x9A, 0xE3, 0xF3, 0x3E, 0x8C, 0xEB, 0xF2, 0x05, 0x2C,
    0x8F, 0x7B, 0x3E, 0xCF, 0xD1, 0xA1, 0xDE, 0xA9, 0x8C, 0x2F, 0x6E, 0x2F, 0x4A, 0x26, 0xDF, 0x31,
    0xD2, 0xAD, 0xBB, 0xA4, 0x25, 0x90, 0x3D, 0xC6, 0x16, 0x90, 0x2C, 0xA8, 0x67, 0xC6, 0xC5, 0x10,
    0x87, 0x1B, 0x20, 0xCB, 0x04, 0x4A, 0x6B, 0x07, 0x75, 0xC0, 0x68, 0x5D, 0xE6, 0x5B, 0x4D, 0x98,
    0xF4, 0x43, 0x37, 0x00, 0xC2, 0x10, 0x0C, 0xAD, 0x7D, 0xEF, 0xEF, 0xA2, 0xA0, 0x25, 0xD8, 0xFB,
    0xDC, 0xA9, 0x8D, 0x01, 0x83, 0x52, 0x2C, 0x5B, 0xAC,
];

/// Starting key index for a buffer of `size` bytes.
#[inline]
pub fn seed(size: usize) -> usize {
    // The parent computes this in 32-bit unsigned arithmetic.
    let offset: u32 = SEED_BASE.wrapping_add(SEED_SCALE.wrapping_mul(size as u32));
    (offset as usize) % KEY_LENGTH
}

/// Encrypt or decrypt `data` in place. Applying it twice restores the input.
pub fn transform(data: &mut [u8]) {
    if data.is_empty() {
        return;
    }
    let mut key_index: usize = seed(data.len());
    for byte in data.iter_mut() {
        *byte ^= KEY[key_index];
        key_index += 1;
        if key_index == KEY_LENGTH {
            key_index = 0;
        }
    }
}
