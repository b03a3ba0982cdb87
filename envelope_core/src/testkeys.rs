// Shared RSA fixtures: 2048-bit generation is slow, so each key is made once per test binary.
use std::sync::{Arc, OnceLock};

use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::keys::{DEFAULT_KEY_BITS, KeyStore, generate_key_pair};

fn cached(cell: &'static OnceLock<RsaPrivateKey>) -> &'static RsaPrivateKey {
    cell.get_or_init(|| generate_key_pair(DEFAULT_KEY_BITS).expect("generate test key"))
}

pub fn client() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    cached(&KEY)
}

pub fn server() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    cached(&KEY)
}

/// A third party nobody configured as a peer.
pub fn stranger() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    cached(&KEY)
}

pub fn store(own: &RsaPrivateKey, peer: &RsaPrivateKey) -> Arc<KeyStore> {
    let store = KeyStore::new(own.clone(), RsaPublicKey::from(own), RsaPublicKey::from(peer))
        .expect("consistent test key store");
    Arc::new(store)
}

pub fn client_store() -> Arc<KeyStore> {
    store(client(), server())
}

pub fn server_store() -> Arc<KeyStore> {
    store(server(), client())
}
