//! Legacy Kasa wire codec.
//! Autokey XOR obfuscation plus 4-byte big-endian length framing for TCP.
//!
//! Every payload byte is XORed with the previous ciphertext byte (seeded with
//! a fixed initial key), so decoding feeds the wire bytes back into the
//! keystream. This is obfuscation only, not cryptographic confidentiality:
//! anyone on the network segment can decode the traffic.

use crate::error::{KasaError, Result};
use byteorder::{BigEndian, ByteOrder};

/// Initial keystream byte of the autokey cipher.
pub const INITIAL_KEY: u8 = 0xAB;

/// Upper bound on a declared frame payload. A corrupt or malicious length
/// prefix must not cause unbounded buffering.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Obfuscate a payload without framing (datagram form, used for UDP where the
/// datagram boundary is the frame boundary).
pub fn obfuscate(plaintext: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plaintext
        .iter()
        .map(|&b| {
            key ^= b;
            key
        })
        .collect()
}

/// Reverse [`obfuscate`]. The keystream is the previous *ciphertext* byte, so
/// this never fails regardless of input.
pub fn deobfuscate(ciphertext: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    ciphertext
        .iter()
        .map(|&c| {
            let p = key ^ c;
            key = c;
            p
        })
        .collect()
}

/// Encode a payload into a length-prefixed obfuscated frame (TCP form).
pub fn encode(plaintext: &[u8]) -> Vec<u8> {
    let mut header = [0u8; 4];
    BigEndian::write_u32(&mut header, plaintext.len() as u32);
    let mut frame = Vec::with_capacity(4 + plaintext.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&obfuscate(plaintext));
    frame
}

/// Validate a frame header and return the declared payload length.
///
/// Used by the transport to size incremental reads; rejects lengths above
/// [`MAX_FRAME_LEN`] before any buffer is allocated.
pub fn declared_len(header: [u8; 4]) -> Result<usize> {
    let len = BigEndian::read_u32(&header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(KasaError::Framing(format!(
            "declared frame length {} exceeds maximum {}",
            len, MAX_FRAME_LEN
        )));
    }
    Ok(len)
}

/// Decode a complete length-prefixed frame back into the payload.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 4 {
        return Err(KasaError::Framing("frame shorter than header".into()));
    }
    let len = declared_len([frame[0], frame[1], frame[2], frame[3]])?;
    let body = &frame[4..];
    if body.len() < len {
        return Err(KasaError::Framing(format!(
            "frame truncated: declared {} bytes, got {}",
            len,
            body.len()
        )));
    }
    Ok(deobfuscate(&body[..len]))
}
