// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use sha2::{Digest, Sha256};

/// Number of bytes of the public key's SHA-256 that identify it.
pub const KEY_HASH_SZ: usize = 4;

/// A signature over the mfg hash, as recorded in the manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MfgSignature {
    pub key_hash: Vec<u8>,
    /// DER-encoded ECDSA signature.
    pub sig: Vec<u8>,
}

/// Loads an ECDSA P-256 private key from a PKCS#8 PEM file.
pub fn load_key(path: &Path) -> Result<SigningKey> {
    let pem = std::fs::read_to_string(path).with_context(|| {
        format!("could not read signing key {}", path.display())
    })?;
    let secret = p256::SecretKey::from_pkcs8_pem(&pem).map_err(|e| {
        anyhow!("{}: not a PKCS#8 P-256 private key: {}", path.display(), e)
    })?;
    Ok(SigningKey::from(secret))
}

/// Truncated SHA-256 of the uncompressed SEC1 public key.
pub fn key_hash(key: &VerifyingKey) -> Vec<u8> {
    let point = key.to_encoded_point(false);
    Sha256::digest(point.as_bytes())[..KEY_HASH_SZ].to_vec()
}

/// Signs `hash` directly, treating it as an already-computed digest.
pub fn sign_hash(key: &SigningKey, hash: &[u8]) -> Result<MfgSignature> {
    let sig: Signature = key
        .sign_prehash(hash)
        .map_err(|e| anyhow!("signing failed: {}", e))?;
    Ok(MfgSignature {
        key_hash: key_hash(key.verifying_key()),
        sig: sig.to_der().as_bytes().to_vec(),
    })
}

pub fn sign_all(keys: &[SigningKey], hash: &[u8]) -> Result<Vec<MfgSignature>> {
    keys.iter().map(|k| sign_hash(k, hash)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::pkcs8::{EncodePrivateKey, LineEnding};

    fn key() -> SigningKey {
        SigningKey::from_slice(&[0x11; 32]).unwrap()
    }

    #[test]
    fn signature_verifies() {
        let key = key();
        let hash = [0xa5; 32];
        let s = sign_hash(&key, &hash).unwrap();
        assert_eq!(s.key_hash.len(), KEY_HASH_SZ);
        assert_eq!(s.key_hash, key_hash(key.verifying_key()));

        let sig = Signature::from_der(&s.sig).unwrap();
        key.verifying_key().verify_prehash(&hash, &sig).unwrap();
        assert!(key.verifying_key().verify_prehash(&[0x5a; 32], &sig).is_err());

        // RFC 6979: same key and hash, same signature.
        assert_eq!(sign_hash(&key, &hash).unwrap(), s);
    }

    #[test]
    fn load_pem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        let secret = p256::SecretKey::from_slice(&[0x11; 32]).unwrap();
        let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let loaded = load_key(&path).unwrap();
        assert_eq!(loaded.verifying_key(), key().verifying_key());

        std::fs::write(&path, "not a key").unwrap();
        assert!(load_key(&path).is_err());
    }
}
