//! Connection authentication and identity material.
//!
//! The main bus authenticates every connection with a time-based one-time
//! password over a shared secret (HMAC-SHA256, 30-second steps, one step
//! of skew). The organism's long-term ed25519 key signs and verifies
//! privileged commands; both load from plain files referenced in the
//! bootstrap configuration.

use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// RFC 6238 verifier over a shared secret.
#[derive(Debug, Clone)]
pub struct TotpAuthenticator {
    secret: Vec<u8>,
    step_secs: u64,
    skew_steps: u64,
}

impl TotpAuthenticator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            step_secs: 30,
            skew_steps: 1,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let secret = std::fs::read(path)
            .map_err(|e| format!("cannot read TOTP secret {}: {e}", path.display()))?;
        if secret.len() < 16 {
            return Err(format!(
                "TOTP secret {} is too short ({} bytes, need 16)",
                path.display(),
                secret.len()
            ));
        }
        Ok(Self::new(secret))
    }

    fn code_for_counter(&self, counter: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // Dynamic truncation.
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = ((digest[offset] as u32 & 0x7f) << 24)
            | ((digest[offset + 1] as u32) << 16)
            | ((digest[offset + 2] as u32) << 8)
            | (digest[offset + 3] as u32);
        format!("{:06}", binary % 1_000_000)
    }

    /// Code for a unix timestamp (client side and tests).
    pub fn generate(&self, now_unix: u64) -> String {
        self.code_for_counter(now_unix / self.step_secs)
    }

    /// Accepts the current step plus/minus the configured skew.
    pub fn verify(&self, code: &str, now_unix: u64) -> bool {
        let counter = now_unix / self.step_secs;
        let lo = counter.saturating_sub(self.skew_steps);
        let hi = counter + self.skew_steps;
        (lo..=hi).any(|c| self.code_for_counter(c) == code)
    }
}

// ── Identity key ──

/// Load the organism's signing key: 32 raw bytes, or 64 hex characters.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("cannot read identity key {}: {e}", path.display()))?;

    let raw: [u8; 32] = if bytes.len() == 32 {
        bytes.as_slice().try_into().expect("length checked")
    } else {
        let text = String::from_utf8_lossy(&bytes);
        let decoded = decode_hex(text.trim())
            .ok_or_else(|| format!("identity key {} is neither raw nor hex", path.display()))?;
        decoded
            .try_into()
            .map_err(|_| format!("identity key {} has the wrong length", path.display()))?
    };

    Ok(SigningKey::from_bytes(&raw))
}

/// Parse a hex-encoded verifying key (gateway trust anchors).
pub fn parse_verifying_key(hex: &str) -> Result<VerifyingKey, String> {
    let bytes = decode_hex(hex.trim()).ok_or_else(|| "invalid hex public key".to_string())?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "public key has the wrong length".to_string())?;
    VerifyingKey::from_bytes(&raw).map_err(|e| format!("invalid public key: {e}"))
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, Verifier};

    fn authenticator() -> TotpAuthenticator {
        TotpAuthenticator::new(b"a-shared-secret-of-decent-length".to_vec())
    }

    #[test]
    fn code_round_trips() {
        let auth = authenticator();
        let now = 1_750_000_000;
        let code = auth.generate(now);
        assert_eq!(code.len(), 6);
        assert!(auth.verify(&code, now));
    }

    #[test]
    fn skew_window_accepted() {
        let auth = authenticator();
        let now = 1_750_000_000;
        let previous_step = auth.generate(now - 30);
        assert!(auth.verify(&previous_step, now));

        let two_steps_ago = auth.generate(now - 90);
        assert!(!auth.verify(&two_steps_ago, now));
    }

    #[test]
    fn wrong_code_rejected() {
        let auth = authenticator();
        assert!(!auth.verify("000000", 1_750_000_000));
    }

    #[test]
    fn different_secrets_differ() {
        let a = authenticator();
        let b = TotpAuthenticator::new(b"another-secret-of-decent-length!".to_vec());
        let now = 1_750_000_000;
        assert_ne!(a.generate(now), b.generate(now));
    }

    #[test]
    fn short_secret_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("totp.secret");
        std::fs::write(&path, b"short").unwrap();
        assert!(TotpAuthenticator::from_file(&path).is_err());
    }

    #[test]
    fn signing_key_loads_raw_and_hex() {
        let dir = tempfile::TempDir::new().unwrap();
        let raw = [7u8; 32];

        let raw_path = dir.path().join("id.raw");
        std::fs::write(&raw_path, raw).unwrap();
        let from_raw = load_signing_key(&raw_path).unwrap();

        let hex_path = dir.path().join("id.hex");
        std::fs::write(&hex_path, encode_hex(&raw)).unwrap();
        let from_hex = load_signing_key(&hex_path).unwrap();

        assert_eq!(from_raw.to_bytes(), from_hex.to_bytes());

        // And the derived public key verifies its own signatures.
        let sig = from_raw.sign(b"payload");
        from_raw.verifying_key().verify(b"payload", &sig).unwrap();
    }

    #[test]
    fn hex_helpers_round_trip() {
        let bytes = vec![0x00, 0xff, 0x10, 0xab];
        assert_eq!(decode_hex(&encode_hex(&bytes)).unwrap(), bytes);
        assert!(decode_hex("abc").is_none());
        assert!(decode_hex("zz").is_none());
    }

    #[test]
    fn verifying_key_parses_from_hex() {
        let signing = SigningKey::from_bytes(&[9u8; 32]);
        let hex = encode_hex(signing.verifying_key().as_bytes());
        let parsed = parse_verifying_key(&hex).unwrap();
        assert_eq!(parsed, signing.verifying_key());
    }
}
