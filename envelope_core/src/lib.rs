// lib.rs — Hybrid RSA/AES envelope exchanged over CRLF-framed TCP

pub mod cipher;
pub mod codec;
pub mod error;
pub mod exchange;
pub mod keys;
pub mod pool;
pub mod server;
pub mod transport;

#[cfg(test)]
mod testkeys;

// =============================== Common =====================================

pub const DEFAULT_PORT: u16 = 9090;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

pub use cipher::{Envelope, HybridCipher, KeyWrap};
pub use codec::{CrLfCodec, DEFAULT_MAX_FRAME_LEN};
pub use error::{ExchangeError, ExchangeResult, NetworkError};
pub use exchange::{ClientConfig, ExchangeState, SecureClient};
pub use keys::{KeyPaths, KeyStore};
pub use pool::{ConnectionPool, PoolConfig};
pub use server::{AcknowledgeHandler, DEFAULT_SHUTDOWN_GRACE, MessageHandler, SecureServer, ServerConfig};
