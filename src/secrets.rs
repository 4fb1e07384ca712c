//! Passphrase-encrypted environment blobs
//!
//! Lets a team pass an app's environment around as an opaque string.
//! Uses PBKDF2-HMAC-SHA256 for key derivation and AES-256-GCM for
//! authenticated encryption.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{bail, Context, Result};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;

/// Prefix identifying the blob format version
const BLOB_PREFIX: &str = "cheetah:v1:";
/// Length of the PBKDF2 salt in bytes
const SALT_LENGTH: usize = 16;
/// Length of the GCM nonce in bytes (96 bits)
const NONCE_LENGTH: usize = 12;
/// PBKDF2 iteration count
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Derived key length in bytes (256 bits)
const KEY_LENGTH: usize = 32;

/// Plaintext payload carried inside a blob
#[derive(Serialize, Deserialize)]
struct EnvEnvelope {
    app: String,
    vars: HashMap<String, String>,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt an app's environment under a passphrase.
///
/// The binary payload is `salt || nonce || ciphertext+tag`, base64-encoded
/// and prefixed with the format version. Salt and nonce are random, so two
/// encryptions of the same input produce distinct blobs.
pub fn encrypt_env(app: &str, vars: &HashMap<String, String>, passphrase: &str) -> Result<String> {
    let plaintext = serde_json::to_vec(&EnvEnvelope {
        app: app.to_string(),
        vars: vars.clone(),
    })
    .context("marshal envelope")?;

    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow::anyhow!("aes cipher: {e}"))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
        .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

    let mut blob = Vec::with_capacity(SALT_LENGTH + NONCE_LENGTH + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);

    Ok(format!(
        "{}{}",
        BLOB_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(blob)
    ))
}

/// Decrypt a blob produced by [`encrypt_env`], returning the app name and
/// its variables.
///
/// Authentication failure is reported uniformly so the error cannot be used
/// as a padding oracle.
pub fn decrypt_env(blob: &str, passphrase: &str) -> Result<(String, HashMap<String, String>)> {
    let Some(encoded) = blob.strip_prefix(BLOB_PREFIX) else {
        bail!("invalid blob format");
    };

    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("base64 decode")?;

    if raw.len() < SALT_LENGTH + NONCE_LENGTH + 1 {
        bail!("blob too short");
    }

    let salt = &raw[..SALT_LENGTH];
    let nonce = &raw[SALT_LENGTH..SALT_LENGTH + NONCE_LENGTH];
    let ciphertext = &raw[SALT_LENGTH + NONCE_LENGTH..];

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow::anyhow!("aes cipher: {e}"))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("decryption failed: wrong passphrase or corrupted data"))?;

    let envelope: EnvEnvelope = serde_json::from_slice(&plaintext).context("unmarshal envelope")?;
    Ok((envelope.app, envelope.vars))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cases = [
            ("auth", "team-secret", vars(&[("DATABASE_URL", "postgres://localhost/auth")])),
            ("greet", "p@ss!", vars(&[("API_KEY", "abc"), ("PORT", "8080"), ("SECRET", "xyz")])),
            ("app", "pass", vars(&[])),
            ("svc", "p\u{e4}ssw\u{f6}rd", vars(&[("KEY", "value")])),
        ];

        for (app, passphrase, v) in cases {
            let blob = encrypt_env(app, &v, passphrase).unwrap();
            assert!(blob.starts_with(BLOB_PREFIX));

            let (got_app, got_vars) = decrypt_env(&blob, passphrase).unwrap();
            assert_eq!(got_app, app);
            assert_eq!(got_vars, v);
        }
    }

    #[test]
    fn test_decrypt_wrong_passphrase() {
        let blob = encrypt_env("app", &vars(&[("K", "V")]), "correct").unwrap();

        let err = decrypt_env(&blob, "wrong").unwrap_err();
        assert!(err.to_string().contains("decryption failed"));
    }

    #[test]
    fn test_decrypt_invalid_blob() {
        let cases = [
            ("garbage", "invalid blob format"),
            ("cheetah:v1:!!!!", "base64 decode"),
            (
                &format!(
                    "cheetah:v1:{}",
                    base64::engine::general_purpose::STANDARD.encode(b"short")
                ),
                "blob too short",
            ),
        ];

        for (blob, want) in cases {
            let err = decrypt_env(blob, "pass").unwrap_err();
            assert!(
                format!("{err:#}").contains(want),
                "blob {blob:?}: expected {want:?} in {err:#}"
            );
        }
    }

    #[test]
    fn test_encrypt_produces_distinct_blobs() {
        let v = vars(&[("K", "V")]);
        let blob1 = encrypt_env("app", &v, "pass").unwrap();
        let blob2 = encrypt_env("app", &v, "pass").unwrap();
        assert_ne!(blob1, blob2);
    }
}
