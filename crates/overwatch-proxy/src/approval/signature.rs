//! Webhook request signing and verification.
//!
//! The webhook caller signs the exact serialized request body with
//! HMAC-SHA256 and sends the lowercase hex digest as
//! `X-Overwatch-Signature: sha256=<hex>`. Verification recomputes the digest
//! and compares in constant time; a length mismatch is rejected without an
//! early exit inside the comparison loop.

use sha2::{Digest, Sha256};

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Overwatch-Signature";

/// Why verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    MissingSignatureHeader,
    MissingSecret,
    /// Header is not `sha256=<hex>` with a well-formed digest.
    InvalidFormat,
    SignatureMismatch,
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            VerifyFailure::MissingSignatureHeader => "missing signature header",
            VerifyFailure::MissingSecret => "missing secret",
            VerifyFailure::InvalidFormat => "invalid format",
            VerifyFailure::SignatureMismatch => "signature mismatch",
        };
        f.write_str(text)
    }
}

/// Detailed verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub reason: Option<VerifyFailure>,
}

/// HMAC-SHA256 digest of `body`, lowercase hex.
pub fn sign_hex(secret: &[u8], body: &[u8]) -> String {
    hex::encode(hmac_sha256(secret, body))
}

/// The full header value: `sha256=<hex>`.
pub fn signature_header_value(secret: &[u8], body: &[u8]) -> String {
    format!("sha256={}", sign_hex(secret, body))
}

/// Verify a signature header against a body and secret.
pub fn verify(body: &[u8], header: &str, secret: &[u8]) -> bool {
    verify_detailed(body, Some(header), Some(secret)).valid
}

/// Verification with a failure reason.
pub fn verify_detailed(
    body: &[u8],
    header: Option<&str>,
    secret: Option<&[u8]>,
) -> VerifyOutcome {
    let Some(header) = header else {
        return failure(VerifyFailure::MissingSignatureHeader);
    };
    let Some(secret) = secret else {
        return failure(VerifyFailure::MissingSecret);
    };
    let Some(provided_hex) = header.strip_prefix("sha256=") else {
        return failure(VerifyFailure::InvalidFormat);
    };
    let Ok(provided) = hex::decode(provided_hex) else {
        return failure(VerifyFailure::InvalidFormat);
    };

    let expected = hmac_sha256(secret, body);
    if constant_time_eq(&expected, &provided) {
        VerifyOutcome {
            valid: true,
            reason: None,
        }
    } else {
        failure(VerifyFailure::SignatureMismatch)
    }
}

fn failure(reason: VerifyFailure) -> VerifyOutcome {
    VerifyOutcome {
        valid: false,
        reason: Some(reason),
    }
}

fn hmac_sha256(secret: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;
    let mut key_block = [0u8; BLOCK_SIZE];
    if secret.len() > BLOCK_SIZE {
        let digest = Sha256::digest(secret);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..secret.len()].copy_from_slice(secret);
    }

    let mut o_key_pad = [0u8; BLOCK_SIZE];
    let mut i_key_pad = [0u8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        o_key_pad[i] = key_block[i] ^ 0x5c;
        i_key_pad[i] = key_block[i] ^ 0x36;
    }

    let mut inner = Sha256::new();
    inner.update(i_key_pad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(o_key_pad);
    outer.update(inner_hash);
    outer.finalize().into()
}

/// XOR-accumulating comparison: equal-length inputs take the same time
/// regardless of where they differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
