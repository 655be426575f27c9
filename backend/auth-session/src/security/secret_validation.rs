//! Signing secret strength checks
//!
//! HS256 is only as strong as its secret, so weak secrets are rejected when
//! settings are loaded instead of being discovered after tokens are forged.

const MIN_SECRET_LENGTH: usize = 32; // 256 bits
const RECOMMENDED_SECRET_LENGTH: usize = 64;
const MIN_ENTROPY_BITS_PER_BYTE: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStrength {
    /// Reject
    Weak,
    /// Accept with a warning
    Acceptable,
    Strong,
}

/// Classify a signing secret by length, Shannon entropy and obvious patterns
pub fn validate_secret_strength(secret: &str) -> SecretStrength {
    let bytes = secret.as_bytes();

    if bytes.len() < MIN_SECRET_LENGTH {
        return SecretStrength::Weak;
    }

    let entropy = shannon_entropy(bytes);
    if entropy < MIN_ENTROPY_BITS_PER_BYTE || has_obvious_patterns(bytes) {
        return SecretStrength::Weak;
    }

    if bytes.len() >= RECOMMENDED_SECRET_LENGTH && entropy >= 5.0 {
        SecretStrength::Strong
    } else {
        SecretStrength::Acceptable
    }
}

/// Bits per byte, 0-8
fn shannon_entropy(data: &[u8]) -> f64 {
    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Long runs of one byte or of an ascending sequence ("abcdef", "123456")
fn has_obvious_patterns(data: &[u8]) -> bool {
    const MAX_RUN: usize = 8;

    let mut repeat_run = 1;
    let mut sequence_run = 1;
    for window in data.windows(2) {
        if window[0] == window[1] {
            repeat_run += 1;
        } else {
            repeat_run = 1;
        }

        if window[1] == window[0].wrapping_add(1) {
            sequence_run += 1;
        } else {
            sequence_run = 1;
        }

        if repeat_run >= MAX_RUN || sequence_run >= MAX_RUN {
            return true;
        }
    }
    false
}
