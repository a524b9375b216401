//! [`IntegrityGate`] – the check every [`ComputeTask`] passes before it runs.
//!
//! A task is admitted when either:
//!
//! 1. its `task_hash` is on the gate's allow-list, or
//! 2. its `task_signature` is a valid Ed25519 signature over the `task_hash`
//!    bytes by one of the trusted catalog keys.
//!
//! Anything else is refused with [`PoolError::Authorization`].  The gate never
//! looks at the task parameters.
//!
//! # Example
//!
//! ```
//! use tidepool_kernel::IntegrityGate;
//!
//! let mut gate = IntegrityGate::new();
//! gate.allow_hash("9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08");
//! assert!(gate.is_allowed("9F86D081884C7D659A2FEAA0C55AD015A3BF4F1B2B0B822CD15D6C15B0F00A08"));
//! ```

use std::collections::HashSet;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;
use tidepool_types::{ComputeTask, PoolError};
use tracing::warn;

/// Errors raised while configuring trusted keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("trusted key is not valid hex")]
    Hex,
    #[error("trusted key must be 32 bytes, got {0}")]
    Length(usize),
    #[error("trusted key is not a valid Ed25519 point")]
    Invalid,
}

#[derive(Default, Clone)]
pub struct IntegrityGate {
    allowed_hashes: HashSet<String>,
    trusted_keys: Vec<VerifyingKey>,
}

impl IntegrityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a gate from allow-listed hashes and hex-encoded trusted keys.
    pub fn from_config<'a>(
        hashes: impl IntoIterator<Item = &'a str>,
        keys_hex: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, KeyError> {
        let mut gate = Self::new();
        for hash in hashes {
            gate.allow_hash(hash);
        }
        for key in keys_hex {
            gate.trust_key_hex(key)?;
        }
        Ok(gate)
    }

    /// Add `hash` to the allow-list.  Hashes compare case-insensitively.
    pub fn allow_hash(&mut self, hash: &str) {
        self.allowed_hashes.insert(hash.to_ascii_lowercase());
    }

    pub fn trust_key(&mut self, key: VerifyingKey) {
        self.trusted_keys.push(key);
    }

    pub fn trust_key_hex(&mut self, key_hex: &str) -> Result<(), KeyError> {
        let bytes = hex::decode(key_hex.trim()).map_err(|_| KeyError::Hex)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(bytes.len()))?;
        let key = VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::Invalid)?;
        self.trust_key(key);
        Ok(())
    }

    pub fn is_allowed(&self, hash: &str) -> bool {
        self.allowed_hashes.contains(&hash.to_ascii_lowercase())
    }

    /// Admit or refuse `task`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Authorization`] when the hash is not allow-listed and no
    /// signature verifies against a trusted key.
    pub fn verify(&self, task: &ComputeTask) -> Result<(), PoolError> {
        if self.is_allowed(&task.task_hash) {
            return Ok(());
        }
        let reason = match task.task_signature.as_deref() {
            None => "hash not allow-listed and task is unsigned".to_string(),
            Some(sig_hex) => match self.verify_signature(&task.task_hash, sig_hex) {
                Ok(()) => return Ok(()),
                Err(reason) => reason,
            },
        };
        warn!(
            task_id = %task.id,
            operation_id = %task.operation_id,
            reason = %reason,
            "integrity check refused task"
        );
        Err(PoolError::Authorization {
            task_id: task.id,
            reason,
        })
    }

    fn verify_signature(&self, task_hash: &str, sig_hex: &str) -> Result<(), String> {
        if self.trusted_keys.is_empty() {
            return Err("signed task but no trusted catalog keys configured".to_string());
        }
        let sig_bytes = hex::decode(sig_hex.trim()).map_err(|_| "signature is not hex".to_string())?;
        let sig_arr: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("signature must be 64 bytes, got {}", sig_bytes.len()))?;
        let signature = Signature::from_bytes(&sig_arr);
        let trusted = self
            .trusted_keys
            .iter()
            .any(|key| key.verify(task_hash.as_bytes(), &signature).is_ok());
        if trusted {
            Ok(())
        } else {
            Err("signature does not verify against any trusted key".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ed25519_dalek::{Signer, SigningKey};
    use tidepool_types::TaskType;
    use uuid::Uuid;

    fn task(hash: &str, signature: Option<String>) -> ComputeTask {
        ComputeTask {
            id: Uuid::new_v4(),
            operation_id: "op-1".into(),
            operation_name: "prime_search".into(),
            task_type: TaskType::PrimeSearch,
            parameters: serde_json::json!({"start": 1, "end": 5}),
            task_hash: hash.into(),
            task_signature: signature,
            priority: 1,
            estimated_duration_ms: 1_000,
            created_at: Utc::now(),
        }
    }

    fn catalog_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn allow_listed_hash_passes() {
        let mut gate = IntegrityGate::new();
        gate.allow_hash("abc123");
        assert!(gate.verify(&task("ABC123", None)).is_ok());
    }

    #[test]
    fn unknown_unsigned_hash_is_refused() {
        let gate = IntegrityGate::new();
        let t = task("deadbeef", None);
        match gate.verify(&t) {
            Err(PoolError::Authorization { task_id, .. }) => assert_eq!(task_id, t.id),
            other => panic!("expected authorization error, got {other:?}"),
        }
    }

    #[test]
    fn valid_signature_from_trusted_key_passes() {
        let key = catalog_key();
        let mut gate = IntegrityGate::new();
        gate.trust_key(key.verifying_key());
        let sig = key.sign(b"cafebabe");
        assert!(gate.verify(&task("cafebabe", Some(hex::encode(sig.to_bytes())))).is_ok());
    }

    #[test]
    fn signature_over_other_hash_is_refused() {
        let key = catalog_key();
        let mut gate = IntegrityGate::new();
        gate.trust_key(key.verifying_key());
        let sig = key.sign(b"other-hash");
        let result = gate.verify(&task("cafebabe", Some(hex::encode(sig.to_bytes()))));
        assert!(matches!(result, Err(PoolError::Authorization { .. })));
    }

    #[test]
    fn signature_from_untrusted_key_is_refused() {
        let mut gate = IntegrityGate::new();
        gate.trust_key(catalog_key().verifying_key());
        let rogue = SigningKey::from_bytes(&[9u8; 32]);
        let sig = rogue.sign(b"cafebabe");
        let result = gate.verify(&task("cafebabe", Some(hex::encode(sig.to_bytes()))));
        assert!(matches!(result, Err(PoolError::Authorization { .. })));
    }

    #[test]
    fn malformed_signature_is_refused() {
        let mut gate = IntegrityGate::new();
        gate.trust_key(catalog_key().verifying_key());
        let result = gate.verify(&task("cafebabe", Some("zz-not-hex".into())));
        assert!(matches!(result, Err(PoolError::Authorization { .. })));
        let short = gate.verify(&task("cafebabe", Some("abcd".into())));
        assert!(matches!(short, Err(PoolError::Authorization { .. })));
    }

    #[test]
    fn from_config_parses_hex_keys() {
        let key_hex = hex::encode(catalog_key().verifying_key().to_bytes());
        let gate = IntegrityGate::from_config(["aa", "bb"], [key_hex.as_str()]).unwrap();
        assert!(gate.is_allowed("AA"));
        assert!(gate.is_allowed("bb"));
        assert!(!gate.is_allowed("cc"));
    }

    #[test]
    fn from_config_rejects_short_key() {
        let err = IntegrityGate::from_config([], ["abcd"]).err().unwrap();
        assert_eq!(err, KeyError::Length(2));
    }

    #[test]
    fn key_errors_are_std_errors_with_messages() {
        let err: Box<dyn std::error::Error> = Box::new(KeyError::Length(2));
        assert_eq!(err.to_string(), "trusted key must be 32 bytes, got 2");
        assert_eq!(KeyError::Hex.to_string(), "trusted key is not valid hex");
    }
}
