//! Raw-RSA block decryption stage.
//!
//! Unseals a fixed-size big-endian block with a textbook private-key
//! operation (no padding scheme), then optionally extracts an XTEA session
//! key from the head of the plaintext into the connection context. This is
//! the login handshake shape of Tibia-family protocols.

use anyhow::{bail, Context, Result};
use num_bigint::BigUint;

use super::{xtea, Transform, TransformContext};
use crate::schema::TransformSpec;

/// 1024-bit modulus.
const DEFAULT_BLOCK_LEN: usize = 128;

pub struct RsaTransform {
    offset: usize,
    block_len: usize,
    n: BigUint,
    d: BigUint,
    xtea_key_output: Option<String>,
}

impl RsaTransform {
    pub fn new(
        offset: usize,
        block_len: usize,
        n: BigUint,
        d: BigUint,
        xtea_key_output: Option<String>,
    ) -> Self {
        RsaTransform {
            offset,
            block_len,
            n,
            d,
            xtea_key_output,
        }
    }

    pub fn from_spec(spec: &TransformSpec) -> Result<Self> {
        let offset = spec.opt_u64("offset").unwrap_or(0) as usize;
        let block_len = spec.opt_u64("length").unwrap_or(DEFAULT_BLOCK_LEN as u64) as usize;
        if block_len == 0 {
            bail!("rsa block length must be nonzero");
        }
        let n = parse_biguint(spec, "n").context("rsa transform needs a modulus \"n\"")?;
        let d = parse_biguint(spec, "d").context("rsa transform needs an exponent \"d\"")?;
        let xtea_key_output = spec.opt_str("xtea_key_output").map(str::to_string);
        Ok(RsaTransform {
            offset,
            block_len,
            n,
            d,
            xtea_key_output,
        })
    }
}

impl Transform for RsaTransform {
    fn name(&self) -> &'static str {
        "rsa"
    }

    fn apply(&self, mut data: Vec<u8>, ctx: &mut TransformContext) -> Vec<u8> {
        let end = match self.offset.checked_add(self.block_len) {
            Some(e) if e <= data.len() => e,
            _ => return data,
        };

        let c = BigUint::from_bytes_be(&data[self.offset..end]);
        let m = c.modpow(&self.d, &self.n);
        let bytes = m.to_bytes_be();
        if bytes.len() > self.block_len {
            // Modulus wider than the block; leave the message alone.
            return data;
        }

        let pad = self.block_len - bytes.len();
        data[self.offset..self.offset + pad].fill(0);
        data[self.offset + pad..end].copy_from_slice(&bytes);

        if let Some(name) = &self.xtea_key_output {
            if self.block_len >= 16 {
                let words = xtea::key_words_le(&data[self.offset..self.offset + 16]);
                ctx.set(name.clone(), xtea::key_to_value(words));
            }
        }
        data
    }
}

fn parse_biguint(spec: &TransformSpec, key: &str) -> Result<BigUint> {
    let hex = spec
        .opt_str(key)
        .with_context(|| format!("missing option \"{}\"", key))?;
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    BigUint::parse_bytes(hex.as_bytes(), 16)
        .with_context(|| format!("option \"{}\" is not valid hex", key))
}
