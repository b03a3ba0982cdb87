//! Key material: the local RSA pair and the peer's public key.
//!
//! Everything here runs once during start-up. A [`KeyStore`] is immutable
//! afterwards and is shared read-only (behind an `Arc`) by every exchange.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{info, warn};

use crate::error::{ExchangeError, ExchangeResult};

pub const DEFAULT_KEY_BITS: usize = 2048;

/// Where the local key pair lives and what the peer's public key is.
#[derive(Debug, Clone)]
pub struct KeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    /// Base64 X.509 SubjectPublicKeyInfo DER, as found in configuration.
    pub peer_public_key: String,
}

pub struct KeyStore {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    peer_public_key: RsaPublicKey,
}

impl KeyStore {
    /// Fails if `public_key` is not the public half of `private_key`.
    pub fn new(
        private_key: RsaPrivateKey,
        public_key: RsaPublicKey,
        peer_public_key: RsaPublicKey,
    ) -> ExchangeResult<Self> {
        if RsaPublicKey::from(&private_key) != public_key {
            return Err(ExchangeError::KeyLoad(
                "local public key does not match local private key".into(),
            ));
        }
        for (role, key) in [("local", &public_key), ("peer", &peer_public_key)] {
            let bits = key.size() * 8;
            if bits < DEFAULT_KEY_BITS {
                warn!(role, bits, "RSA key shorter than {DEFAULT_KEY_BITS} bits");
            }
        }
        Ok(Self { private_key, public_key, peer_public_key })
    }

    pub fn load(paths: &KeyPaths) -> ExchangeResult<Self> {
        let private_key = load_private_key(&paths.private_key)?;
        let public_key = load_public_key(&paths.public_key)?;
        let peer_public_key = decode_peer_public_key(&paths.peer_public_key)?;
        let store = Self::new(private_key, public_key, peer_public_key)?;
        info!(
            private = %paths.private_key.display(),
            public = %paths.public_key.display(),
            "RSA keys loaded"
        );
        Ok(store)
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn peer_public_key(&self) -> &RsaPublicKey {
        &self.peer_public_key
    }

    /// Own public key in the form the peer puts in its configuration.
    pub fn public_key_base64(&self) -> ExchangeResult<String> {
        encode_public_key_base64(&self.public_key)
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("private_key", &"<redacted>")
            .field("public_key_bits", &(self.public_key.size() * 8))
            .field("peer_public_key_bits", &(self.peer_public_key.size() * 8))
            .finish()
    }
}

fn read_pem(path: &Path) -> ExchangeResult<String> {
    fs::read_to_string(path)
        .map_err(|e| ExchangeError::KeyLoad(format!("read {}: {e}", path.display())))
}

/// PEM PKCS#8 (`BEGIN PRIVATE KEY`); PKCS#1 (`BEGIN RSA PRIVATE KEY`) is accepted too.
pub fn load_private_key(path: impl AsRef<Path>) -> ExchangeResult<RsaPrivateKey> {
    let path = path.as_ref();
    let pem = read_pem(path)?;
    match RsaPrivateKey::from_pkcs8_pem(&pem) {
        Ok(key) => Ok(key),
        Err(pkcs8_err) => RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|_| {
            ExchangeError::KeyLoad(format!("{}: invalid private key: {pkcs8_err}", path.display()))
        }),
    }
}

/// PEM X.509 SubjectPublicKeyInfo (`BEGIN PUBLIC KEY`).
pub fn load_public_key(path: impl AsRef<Path>) -> ExchangeResult<RsaPublicKey> {
    let path = path.as_ref();
    let pem = read_pem(path)?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| {
        ExchangeError::KeyLoad(format!("{}: invalid public key: {e}", path.display()))
    })
}

pub fn decode_peer_public_key(encoded: &str) -> ExchangeResult<RsaPublicKey> {
    let der = B64
        .decode(encoded.trim())
        .map_err(|e| ExchangeError::KeyLoad(format!("peer public key is not base64: {e}")))?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| ExchangeError::KeyLoad(format!("peer public key is not X.509 DER: {e}")))
}

pub fn encode_public_key_base64(key: &RsaPublicKey) -> ExchangeResult<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| ExchangeError::KeyLoad(format!("encode public key: {e}")))?;
    Ok(B64.encode(der.as_bytes()))
}

pub fn generate_key_pair(bits: usize) -> ExchangeResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| ExchangeError::KeyLoad(format!("generate {bits}-bit key: {e}")))
}

/// Writes `<prefix>_private.pem` (PKCS#8) and `<prefix>_public.pem` (SPKI) into `dir`.
pub fn write_key_pair(
    dir: impl AsRef<Path>,
    prefix: &str,
    key: &RsaPrivateKey,
) -> ExchangeResult<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    let private_path = dir.join(format!("{prefix}_private.pem"));
    let public_path = dir.join(format!("{prefix}_public.pem"));

    let private_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ExchangeError::KeyLoad(format!("encode private key: {e}")))?;
    let public_pem = RsaPublicKey::from(key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| ExchangeError::KeyLoad(format!("encode public key: {e}")))?;

    let write = |path: &Path, contents: &str| {
        fs::write(path, contents)
            .map_err(|e| ExchangeError::KeyLoad(format!("write {}: {e}", path.display())))
    };
    write(&private_path, private_pem.as_str())?;
    restrict_permissions(&private_path)?;
    write(&public_path, &public_pem)?;

    Ok((private_path, public_path))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> ExchangeResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| ExchangeError::KeyLoad(format!("chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> ExchangeResult<()> {
    Ok(())
}
