//! Compact Target Codec and Difficulty
//!
//! The compact ("bits") encoding is a base-256 float: one exponent byte and a
//! 24-bit mantissa. Decoding expands it to a full 256-bit target; encoding
//! normalizes so the mantissa's sign bit is clear. Non-compliant encodings
//! (sign bit set, exponent shifting the mantissa past 32 bytes) are rejected
//! rather than silently truncated.

use thiserror::Error;

use quaxis_core::{BlockHeader, Hash256};

/// Compact target of the difficulty-1 reference (Bitcoin genesis)
pub const DIFFICULTY_ONE_BITS: u32 = 0x1d00_ffff;

/// Sign bit inside the 24-bit mantissa; a compliant encoding keeps it clear
const MANTISSA_SIGN_BIT: u32 = 0x0080_0000;

/// Compact-target decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    /// Sign bit set in the mantissa
    #[error("Compact target {0:#010x} has the mantissa sign bit set")]
    SignBitSet(u32),

    /// Exponent pushes the mantissa beyond 256 bits
    #[error("Compact target {0:#010x} overflows 256 bits")]
    Overflow(u32),
}

/// Decode a compact target into its 256-bit form.
pub fn bits_to_target(bits: u32) -> Result<Hash256, TargetError> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x00ff_ffff;

    if mantissa & MANTISSA_SIGN_BIT != 0 {
        return Err(TargetError::SignBitSet(bits));
    }
    // The mantissa occupies bytes [exponent-3, exponent); its highest byte
    // must land inside the 32-byte target.
    if exponent > 32 {
        return Err(TargetError::Overflow(bits));
    }

    let mut target = [0u8; 32];
    if exponent <= 3 {
        let shifted = mantissa >> (8 * (3 - exponent));
        target[0] = (shifted & 0xff) as u8;
        target[1] = ((shifted >> 8) & 0xff) as u8;
        target[2] = ((shifted >> 16) & 0xff) as u8;
    } else {
        let base = exponent - 3;
        target[base] = (mantissa & 0xff) as u8;
        if base + 1 < 32 {
            target[base + 1] = ((mantissa >> 8) & 0xff) as u8;
        }
        if base + 2 < 32 {
            target[base + 2] = ((mantissa >> 16) & 0xff) as u8;
        }
    }

    Ok(Hash256(target))
}

/// Encode a 256-bit target back to compact form.
///
/// Canonical: if the top mantissa byte would set the sign bit, the mantissa
/// is shifted right one byte and the exponent bumped.
pub fn target_to_bits(target: &Hash256) -> u32 {
    let bytes = target.as_bytes();
    let msb = match (0..32).rev().find(|&i| bytes[i] != 0) {
        Some(i) => i,
        None => return 0,
    };

    // Top three bytes become the mantissa; for values shorter than three
    // bytes this shifts them up, which the decoder's exponent<=3 path undoes.
    let mut size = msb + 1;
    let mut mantissa: u32 = 0;
    for step in 0..3 {
        mantissa <<= 8;
        let idx = msb as isize - step;
        if idx >= 0 {
            mantissa |= bytes[idx as usize] as u32;
        }
    }

    if mantissa & MANTISSA_SIGN_BIT != 0 {
        mantissa >>= 8;
        size += 1;
    }

    mantissa | ((size as u32) << 24)
}

/// Difficulty relative to the difficulty-1 target, in floating point.
pub fn difficulty(bits: u32) -> f64 {
    let mantissa = (bits & 0x00ff_ffff) as f64;
    if mantissa == 0.0 {
        return 0.0;
    }

    let mut diff = 65535.0 / mantissa;
    let mut exponent = (bits >> 24) & 0xff;
    while exponent < 29 {
        diff *= 256.0;
        exponent += 1;
    }
    while exponent > 29 {
        diff /= 256.0;
        exponent -= 1;
    }
    diff
}

/// True if `hash <= target` under the little-endian 256-bit ordering.
pub fn meets_target(hash: &Hash256, target: &Hash256) -> bool {
    hash <= target
}

/// Check a header's proof of work against its own compact target.
pub fn check_proof_of_work(header: &BlockHeader) -> Result<bool, TargetError> {
    let target = bits_to_target(header.bits)?;
    Ok(meets_target(&header.hash(), &target))
}
