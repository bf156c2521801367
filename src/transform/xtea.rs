//! XTEA block decryption stage.

use anyhow::{bail, Result};

use super::{decode_hex, Transform, TransformContext};
use crate::codec::Value;
use crate::schema::TransformSpec;

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 32;

/// Decrypts framed messages in 8-byte XTEA blocks, starting at a configured
/// offset so a plaintext size prefix survives. The key comes from the schema
/// (hex) or from the connection context under a configured name; with an
/// all-zero key and no context entry the stage is the identity.
pub struct XteaTransform {
    key: [u32; 4],
    context_key: Option<String>,
    offset: usize,
}

impl XteaTransform {
    pub fn new(key: [u32; 4], context_key: Option<String>, offset: usize) -> Self {
        XteaTransform {
            key,
            context_key,
            offset,
        }
    }

    pub fn from_spec(spec: &TransformSpec) -> Result<Self> {
        let key = match spec.opt_str("key") {
            Some(hex) => parse_key_hex(hex)?,
            None => [0; 4],
        };
        let context_key = spec.opt_str("key_from").map(str::to_string);
        let offset = spec.opt_u64("offset").unwrap_or(0) as usize;
        Ok(XteaTransform {
            key,
            context_key,
            offset,
        })
    }

    fn resolve_key(&self, ctx: &TransformContext) -> Option<[u32; 4]> {
        if self.key != [0; 4] {
            return Some(self.key);
        }
        let name = self.context_key.as_deref()?;
        key_from_value(ctx.get(name)?)
    }
}

impl Transform for XteaTransform {
    fn name(&self) -> &'static str {
        "xtea"
    }

    fn apply(&self, mut data: Vec<u8>, ctx: &mut TransformContext) -> Vec<u8> {
        let key = match self.resolve_key(ctx) {
            Some(k) => k,
            None => return data,
        };
        if self.offset < data.len() {
            xtea_decrypt(&mut data[self.offset..], &key);
        }
        data
    }
}

/// Decrypt in place. Trailing bytes shorter than a block pass through.
pub fn xtea_decrypt(data: &mut [u8], key: &[u32; 4]) {
    for block in data.chunks_exact_mut(8) {
        decrypt_block(block, key);
    }
}

/// Encrypt in place; the inverse of the decrypt stage, exposed for tests
/// and for building inverse pipelines.
pub fn xtea_encrypt(data: &mut [u8], key: &[u32; 4]) {
    for block in data.chunks_exact_mut(8) {
        encrypt_block(block, key);
    }
}

fn decrypt_block(block: &mut [u8], key: &[u32; 4]) {
    let mut v0 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let mut v1 = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    let mut sum = DELTA.wrapping_mul(ROUNDS);
    for _ in 0..ROUNDS {
        v1 = v1.wrapping_sub(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key[((sum >> 11) & 3) as usize])),
        );
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(key[(sum & 3) as usize])),
        );
    }
    block[..4].copy_from_slice(&v0.to_le_bytes());
    block[4..].copy_from_slice(&v1.to_le_bytes());
}

fn encrypt_block(block: &mut [u8], key: &[u32; 4]) {
    let mut v0 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let mut v1 = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    let mut sum = 0u32;
    for _ in 0..ROUNDS {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(key[(sum & 3) as usize])),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key[((sum >> 11) & 3) as usize])),
        );
    }
    block[..4].copy_from_slice(&v0.to_le_bytes());
    block[4..].copy_from_slice(&v1.to_le_bytes());
}

/// First 16 bytes as four little-endian 32-bit words, the context
/// representation of a session key.
pub(crate) fn key_words_le(bytes: &[u8]) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (i, word) in words.iter_mut().enumerate() {
        let o = i * 4;
        *word = u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
    }
    words
}

pub(crate) fn key_to_value(words: [u32; 4]) -> Value {
    Value::List(words.iter().map(|w| Value::U64(*w as u64)).collect())
}

fn key_from_value(v: &Value) -> Option<[u32; 4]> {
    match v {
        Value::List(items) if items.len() == 4 => {
            let mut words = [0u32; 4];
            for (slot, item) in words.iter_mut().zip(items) {
                *slot = item.as_u64()? as u32;
            }
            Some(words)
        }
        Value::Bytes(b) if b.len() >= 16 => Some(key_words_le(b)),
        _ => None,
    }
}

fn parse_key_hex(hex: &str) -> Result<[u32; 4]> {
    let bytes = match decode_hex(hex) {
        Some(b) if b.len() == 16 => b,
        _ => bail!("xtea key must be 32 hex chars (16 bytes)"),
    };
    Ok(key_words_le(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u32; 4] = [0x33221100, 0x77665544, 0xBBAA9988, 0xFFEEDDCC];

    #[test]
    fn encrypt_decrypt_round_trip() {
        let plain = *b"exactly 16 bytes";
        let mut data = plain;
        xtea_encrypt(&mut data, &KEY);
        assert_ne!(data, plain);
        xtea_decrypt(&mut data, &KEY);
        assert_eq!(data, plain);
    }

    #[test]
    fn trailing_bytes_pass_through() {
        let mut data = b"eight bz+tail".to_vec();
        xtea_encrypt(&mut data, &KEY);
        assert_eq!(&data[8..], b"+tail");
        xtea_decrypt(&mut data, &KEY);
        assert_eq!(data, b"eight bz+tail");
    }

    #[test]
    fn zero_key_without_context_is_identity() {
        let t = XteaTransform::new([0; 4], None, 0);
        let mut ctx = TransformContext::new();
        let data = vec![0xAB; 16];
        assert_eq!(t.apply(data.clone(), &mut ctx), data);
    }

    #[test]
    fn context_key_used_when_schema_key_zero() {
        let t = XteaTransform::new([0; 4], Some("session_key".into()), 0);
        let mut ctx = TransformContext::new();

        let plain = vec![0x42; 8];
        let mut encrypted = plain.clone();
        xtea_encrypt(&mut encrypted, &KEY);

        // No key yet: identity.
        assert_eq!(t.apply(encrypted.clone(), &mut ctx), encrypted);

        ctx.set("session_key".into(), key_to_value(KEY));
        assert_eq!(t.apply(encrypted, &mut ctx), plain);
    }

    #[test]
    fn explicit_key_wins_over_context() {
        let t = XteaTransform::new(KEY, Some("session_key".into()), 0);
        let mut ctx = TransformContext::new();
        ctx.set("session_key".into(), key_to_value([1, 2, 3, 4]));

        let plain = vec![7u8; 8];
        let mut encrypted = plain.clone();
        xtea_encrypt(&mut encrypted, &KEY);
        assert_eq!(t.apply(encrypted, &mut ctx), plain);
    }

    #[test]
    fn parse_key_hex_matches_le_words() {
        let key = parse_key_hex("00112233445566778899AABBCCDDEEFF").unwrap();
        assert_eq!(key, [0x33221100, 0x77665544, 0xBBAA9988, 0xFFEEDDCC]);
        assert!(parse_key_hex("0011").is_err());
    }

    #[test]
    fn output_length_equals_input_length() {
        let t = XteaTransform::new(KEY, None, 0);
        let mut ctx = TransformContext::new();
        for len in [0usize, 1, 7, 8, 9, 16, 23] {
            let data = vec![0x5A; len];
            assert_eq!(t.apply(data, &mut ctx).len(), len);
        }
    }

    #[test]
    fn offset_leaves_size_prefix_plaintext() {
        let t = XteaTransform::new(KEY, None, 2);
        let mut ctx = TransformContext::new();

        let mut frame = vec![0x0A, 0x00];
        let mut body = *b"8 bytes!";
        xtea_encrypt(&mut body, &KEY);
        frame.extend_from_slice(&body);

        let out = t.apply(frame, &mut ctx);
        assert_eq!(&out[..2], &[0x0A, 0x00]);
        assert_eq!(&out[2..], b"8 bytes!");
    }
}
