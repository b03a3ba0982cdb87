// Client half of the secure call: encrypt -> frame-send -> frame-receive -> decrypt
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::cipher::{HybridCipher, KeyWrap};
use crate::error::{ExchangeError, ExchangeResult};
use crate::keys::KeyStore;
use crate::pool::{ConnectionPool, PoolConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Encrypting,
    Sending,
    AwaitingResponse,
    Decrypting,
    Complete,
    Failed(String),
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Complete | ExchangeState::Failed(_))
    }
}

/// Lifecycle of one exchange. Terminal states are sticky: there is no retry.
#[derive(Debug)]
pub struct ExchangeTracker {
    id: Uuid,
    state: ExchangeState,
}

impl Default for ExchangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeTracker {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4(), state: ExchangeState::Idle }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// Returns `false` (and stays put) if the exchange already ended.
    pub fn advance(&mut self, next: ExchangeState) -> bool {
        if self.state.is_terminal() {
            warn!(id = %self.id, from = ?self.state, to = ?next, "transition out of terminal state ignored");
            return false;
        }
        debug!(id = %self.id, from = ?self.state, to = ?next, "exchange state");
        self.state = next;
        true
    }

    pub fn fail(&mut self, err: &ExchangeError) -> bool {
        self.advance(ExchangeState::Failed(err.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    /// Bound on waiting for the reply once the request is written.
    pub response_timeout: Duration,
    pub key_wrap: KeyWrap,
}

/// The outbound gateway: `send(plaintext) -> plaintext`.
#[derive(Clone)]
pub struct SecureClient {
    keys: Arc<KeyStore>,
    cipher: HybridCipher,
    pool: ConnectionPool,
    response_timeout: Duration,
}

impl SecureClient {
    pub fn new(keys: Arc<KeyStore>, config: ClientConfig) -> Self {
        Self {
            keys,
            cipher: HybridCipher::new(config.key_wrap),
            pool: ConnectionPool::new(config.pool),
            response_timeout: config.response_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// One full secure round trip. Any failure ends the exchange; the caller
    /// decides whether to try again.
    pub async fn send(&self, plaintext: &str) -> ExchangeResult<String> {
        let mut tracker = ExchangeTracker::new();
        let span = info_span!("exchange", id = %tracker.id(), role = "client");

        async {
            match self.run(&mut tracker, plaintext).await {
                Ok(reply) => {
                    tracker.advance(ExchangeState::Complete);
                    Ok(reply)
                }
                Err(e) => {
                    warn!(error = %e, "exchange failed");
                    tracker.fail(&e);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, tracker: &mut ExchangeTracker, plaintext: &str) -> ExchangeResult<String> {
        tracker.advance(ExchangeState::Encrypting);
        let request = self.cipher.seal_text(plaintext, self.keys.peer_public_key())?;
        debug!(bytes = request.len(), "request sealed");

        // dropped on every early return: socket closed, slot freed
        let mut conn = self.pool.acquire().await?;

        tracker.advance(ExchangeState::Sending);
        conn.send(request.as_bytes()).await?;

        tracker.advance(ExchangeState::AwaitingResponse);
        let frame = conn.receive_with_timeout(self.response_timeout).await?;
        conn.release();

        tracker.advance(ExchangeState::Decrypting);
        let response = std::str::from_utf8(&frame)
            .map_err(|_| ExchangeError::EnvelopeFormat("response is not UTF-8".into()))?;
        self.cipher.open_text(response, self.keys.private_key())
    }
}
