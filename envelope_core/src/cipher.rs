// ============================ Hybrid Crypto Envelope =========================
//
// Wire form: base64(wrapped session key) ":" base64(iv) ":" base64(ciphertext)
//
// The session key is AES-256, fresh per message, wrapped with the recipient's
// RSA public key. The payload is AES-256-CBC with PKCS#7 padding.

use std::fmt;
use std::str::FromStr;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine as _;
use clap::ValueEnum;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ExchangeError, ExchangeResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const ENVELOPE_DELIMITER: char = ':';
pub const SESSION_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// RSA padding used to wrap the session key. Both peers must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
pub enum KeyWrap {
    /// RSAES-PKCS1-v1_5, what `RSA/ECB/PKCS1Padding` peers speak.
    ///
    /// The `rsa` crate's v1.5 decryption is not constant time
    /// (RUSTSEC-2023-0071, "Marvin"), and a responder that replies or hangs
    /// up depending on the unwrap result is a padding oracle. Prefer
    /// `OaepSha256` whenever both peers support it.
    #[default]
    #[serde(rename = "pkcs1v15")]
    #[value(name = "pkcs1v15")]
    Pkcs1v15,
    #[serde(rename = "oaep-sha256")]
    #[value(name = "oaep-sha256")]
    OaepSha256,
}

impl KeyWrap {
    /// The name used in configuration files and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyWrap::Pkcs1v15 => "pkcs1v15",
            KeyWrap::OaepSha256 => "oaep-sha256",
        }
    }
}

/// Ephemeral AES key + IV for exactly one message.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKey {
    key: [u8; SESSION_KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SessionKey {
    fn generate() -> Self {
        let mut session = Self { key: [0u8; SESSION_KEY_LEN], iv: [0u8; IV_LEN] };
        OsRng.fill_bytes(&mut session.key);
        OsRng.fill_bytes(&mut session.iv);
        session
    }
}

/// One encrypted message. `Display` / `FromStr` are the wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub wrapped_key: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{d}{}{d}{}",
            B64.encode(&self.wrapped_key),
            B64.encode(self.iv),
            B64.encode(&self.ciphertext),
            d = ENVELOPE_DELIMITER
        )
    }
}

impl FromStr for Envelope {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split(ENVELOPE_DELIMITER).collect();
        let [wrapped_key, iv, ciphertext] = fields[..] else {
            return Err(ExchangeError::EnvelopeFormat(format!(
                "expected 3 fields, found {}",
                fields.len()
            )));
        };

        let decode = |name: &str, field: &str| {
            B64.decode(field)
                .map_err(|e| ExchangeError::EnvelopeFormat(format!("{name} is not base64: {e}")))
        };
        let wrapped_key = decode("wrapped key", wrapped_key)?;
        let iv_bytes = decode("iv", iv)?;
        let ciphertext = decode("ciphertext", ciphertext)?;

        let iv: [u8; IV_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
            ExchangeError::EnvelopeFormat(format!("iv must be {IV_LEN} bytes, got {}", iv_bytes.len()))
        })?;

        Ok(Envelope { wrapped_key, iv, ciphertext })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HybridCipher {
    wrap: KeyWrap,
}

impl HybridCipher {
    pub fn new(wrap: KeyWrap) -> Self {
        Self { wrap }
    }

    /// Seal `plaintext` for the holder of `recipient`'s private key.
    /// Never deterministic: every call draws a new session key and IV.
    pub fn encrypt(&self, plaintext: &[u8], recipient: &RsaPublicKey) -> ExchangeResult<Envelope> {
        let session = SessionKey::generate();

        let ciphertext = Aes256CbcEnc::new_from_slices(&session.key, &session.iv)
            .map_err(|e| ExchangeError::Crypto(format!("aes init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let wrapped_key = match self.wrap {
            KeyWrap::Pkcs1v15 => recipient.encrypt(&mut OsRng, Pkcs1v15Encrypt, &session.key),
            KeyWrap::OaepSha256 => recipient.encrypt(&mut OsRng, Oaep::new::<Sha256>(), &session.key),
        }
        .map_err(|e| ExchangeError::Crypto(format!("wrap session key: {e}")))?;

        Ok(Envelope { wrapped_key, iv: session.iv, ciphertext })
    }

    /// Parse and open a wire envelope.
    pub fn decrypt(&self, envelope: &str, own_key: &RsaPrivateKey) -> ExchangeResult<Vec<u8>> {
        let envelope: Envelope = envelope.parse()?;
        self.open(&envelope, own_key)
    }

    pub fn open(&self, envelope: &Envelope, own_key: &RsaPrivateKey) -> ExchangeResult<Vec<u8>> {
        let session_key = Zeroizing::new(
            match self.wrap {
                KeyWrap::Pkcs1v15 => own_key.decrypt(Pkcs1v15Encrypt, &envelope.wrapped_key),
                KeyWrap::OaepSha256 => own_key.decrypt(Oaep::new::<Sha256>(), &envelope.wrapped_key),
            }
            .map_err(|e| ExchangeError::Crypto(format!("unwrap session key: {e}")))?,
        );
        if session_key.len() != SESSION_KEY_LEN {
            return Err(ExchangeError::Crypto(format!(
                "unwrapped session key is {} bytes, expected {SESSION_KEY_LEN}",
                session_key.len()
            )));
        }

        Aes256CbcDec::new_from_slices(&session_key, &envelope.iv)
            .map_err(|e| ExchangeError::Crypto(format!("aes init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
            .map_err(|_| ExchangeError::Crypto("bad padding or tampered ciphertext".into()))
    }

    /// Convenience for text payloads: UTF-8 in, wire string out.
    pub fn seal_text(&self, plaintext: &str, recipient: &RsaPublicKey) -> ExchangeResult<String> {
        Ok(self.encrypt(plaintext.as_bytes(), recipient)?.to_string())
    }

    pub fn open_text(&self, envelope: &str, own_key: &RsaPrivateKey) -> ExchangeResult<String> {
        let bytes = self.decrypt(envelope, own_key)?;
        String::from_utf8(bytes)
            .map_err(|_| ExchangeError::Crypto("decrypted payload is not valid UTF-8".into()))
    }
}

// ================================ Tests =====================================
