//! Responder side of the secure call.
//!
//! Each accepted connection runs in its own task: receive one envelope (no
//! timeout), decrypt it with the local private key, ask the
//! [`MessageHandler`] for a reply, seal that reply for the peer and send it
//! back. A failure at any step closes the connection without a reply.
//!
//! On shutdown the server stops accepting, closes kept-alive connections
//! that sit idle between requests, and waits up to `shutdown_grace` for
//! exchanges already under way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cipher::{HybridCipher, KeyWrap};
use crate::error::{ExchangeError, ExchangeResult, NetworkError};
use crate::exchange::{ExchangeState, ExchangeTracker};
use crate::keys::KeyStore;
use crate::transport::{FramedConnection, FramedListener, Incoming};

/// Produces the plaintext reply for one decrypted request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &str) -> ExchangeResult<String>;
}

/// Echo-and-acknowledge: the reply embeds the received text.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeHandler;

pub fn acknowledge(message: &str) -> String {
    format!("Servidor recebeu: [{message}] com sucesso!")
}

#[async_trait]
impl MessageHandler for AcknowledgeHandler {
    async fn handle(&self, message: &str) -> ExchangeResult<String> {
        Ok(acknowledge(message))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_frame_len: usize,
    /// Serve sequential requests on one connection until the peer hangs up.
    pub keep_alive: bool,
    pub key_wrap: KeyWrap,
    /// How long `serve` waits for in-flight exchanges after shutdown.
    pub shutdown_grace: Duration,
}

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct SecureServer {
    listener: FramedListener,
    responder: Arc<Responder>,
    shutdown_grace: Duration,
}

struct Responder {
    keys: Arc<KeyStore>,
    cipher: HybridCipher,
    handler: Arc<dyn MessageHandler>,
    keep_alive: bool,
}

impl SecureServer {
    pub async fn bind(
        config: &ServerConfig,
        keys: Arc<KeyStore>,
        handler: Arc<dyn MessageHandler>,
    ) -> ExchangeResult<Self> {
        let listener = FramedListener::bind(config.bind_addr.as_str(), config.max_frame_len).await?;
        info!(addr = %listener.local_addr()?, keep_alive = config.keep_alive, "listening");
        Ok(Self {
            listener,
            responder: Arc::new(Responder {
                keys,
                cipher: HybridCipher::new(config.key_wrap),
                handler,
                keep_alive: config.keep_alive,
            }),
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> ExchangeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires, then drain: returns once every
    /// connection task has finished or the grace period is over.
    pub async fn serve(self, shutdown: CancellationToken) {
        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested; no longer accepting");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(incoming) => {
                        let responder = self.responder.clone();
                        let shutdown = shutdown.clone();
                        let span = info_span!("connection", peer = %incoming.peer_addr());
                        connections.spawn(
                            async move { responder.handle_incoming(incoming, shutdown).await }.instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        // listener-level failure (e.g. out of file descriptors): don't spin
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        connections.close();
        if !connections.is_empty() {
            info!(in_flight = connections.len(), "waiting for in-flight connections");
        }
        if tokio::time::timeout(self.shutdown_grace, connections.wait()).await.is_err() {
            warn!(abandoned = connections.len(), grace = ?self.shutdown_grace, "grace period over");
        }
    }
}

impl Responder {
    async fn handle_incoming(&self, incoming: Incoming, shutdown: CancellationToken) {
        match incoming.into_connection() {
            Ok(conn) => self.handle_connection(conn, shutdown).await,
            // this peer only; the listener keeps going
            Err(e) => warn!(error = %e, "connection setup failed"),
        }
    }

    async fn handle_connection(&self, mut conn: FramedConnection, shutdown: CancellationToken) {
        let mut served = 0usize;
        loop {
            let mut tracker = ExchangeTracker::new();
            let span = info_span!("exchange", id = %tracker.id(), role = "server");
            tracker.advance(ExchangeState::AwaitingResponse);

            // between kept-alive requests nothing is in flight, so shutdown may cut in
            let received = if served == 0 {
                conn.receive().await
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!(served, "closing idle connection for shutdown");
                        break;
                    }
                    frame = conn.receive() => frame,
                }
            };

            let outcome = match received {
                Ok(frame) => self.respond(&mut conn, &frame, &mut tracker).instrument(span).await,
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(()) => {
                    tracker.advance(ExchangeState::Complete);
                    served += 1;
                    if !self.keep_alive || shutdown.is_cancelled() {
                        break;
                    }
                }
                // peer hung up between requests on a kept-alive connection
                Err(ExchangeError::Network(NetworkError::Reset)) if served > 0 => {
                    debug!(served, "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(id = %tracker.id(), error = %e, "closing without reply");
                    tracker.fail(&e);
                    break;
                }
            }
        }
        debug!(served, "connection closed");
    }

    async fn respond(
        &self,
        conn: &mut FramedConnection,
        frame: &[u8],
        tracker: &mut ExchangeTracker,
    ) -> ExchangeResult<()> {
        debug!(bytes = frame.len(), "encrypted request received");

        tracker.advance(ExchangeState::Decrypting);
        let request = std::str::from_utf8(frame)
            .map_err(|_| ExchangeError::EnvelopeFormat("request is not UTF-8".into()))?;
        let message = self.cipher.open_text(request, self.keys.private_key())?;
        debug!(%message, "request decrypted");

        let reply = self.handler.handle(&message).await?;

        tracker.advance(ExchangeState::Encrypting);
        let sealed = self.cipher.seal_text(&reply, self.keys.peer_public_key())?;

        tracker.advance(ExchangeState::Sending);
        conn.send(sealed.as_bytes()).await?;
        debug!(bytes = sealed.len(), "encrypted reply sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_FRAME_LEN;
    use crate::exchange::{ClientConfig, SecureClient};
    use crate::pool::PoolConfig;
    use crate::testkeys;
    use futures::future::join_all;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn server_config(keep_alive: bool) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            keep_alive,
            key_wrap: KeyWrap::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    async fn start(
        keep_alive: bool,
        handler: Arc<dyn MessageHandler>,
    ) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
        let server = SecureServer::bind(&server_config(keep_alive), testkeys::server_store(), handler)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));
        (addr, shutdown, handle)
    }

    fn client(addr: SocketAddr, size: usize, single_use: bool) -> SecureClient {
        SecureClient::new(
            testkeys::client_store(),
            ClientConfig {
                pool: PoolConfig {
                    address: addr.to_string(),
                    size,
                    single_use,
                    connect_timeout: Duration::from_secs(5),
                    max_frame_len: DEFAULT_MAX_FRAME_LEN,
                },
                response_timeout: Duration::from_secs(10),
                key_wrap: KeyWrap::default(),
            },
        )
    }

    #[tokio::test]
    async fn hello_is_acknowledged_end_to_end() {
        let (addr, shutdown, handle) = start(false, Arc::new(AcknowledgeHandler)).await;

        let reply = client(addr, 1, true).send("hello").await.unwrap();
        assert_eq!(reply, "Servidor recebeu: [hello] com sucesso!");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn handler_sees_decrypted_text() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .with(eq("ping: with delimiter"))
            .times(1)
            .returning(|_| Ok("pong".to_string()));
        let (addr, shutdown, _) = start(false, Arc::new(handler)).await;

        let reply = client(addr, 1, true).send("ping: with delimiter").await.unwrap();
        assert_eq!(reply, "pong");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn handler_error_closes_without_reply() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .returning(|_| Err(ExchangeError::Handler("refused".into())));
        let (addr, shutdown, _) = start(false, Arc::new(handler)).await;

        let err = client(addr, 1, true).send("anything").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Network(NetworkError::Reset)), "got {err}");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn undecryptable_request_does_not_stop_the_server() {
        let (addr, shutdown, _) = start(false, Arc::new(AcknowledgeHandler)).await;

        // sealed for a key the server does not hold
        let wrong = SecureClient::new(
            testkeys::store(testkeys::client(), testkeys::stranger()),
            ClientConfig {
                pool: client(addr, 1, true).pool().config().clone(),
                response_timeout: Duration::from_secs(10),
                key_wrap: KeyWrap::default(),
            },
        );
        let err = wrong.send("lost").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Network(NetworkError::Reset)), "got {err}");

        let reply = client(addr, 1, true).send("still there?").await.unwrap();
        assert_eq!(reply, acknowledge("still there?"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn concurrent_calls_all_complete() {
        let (addr, shutdown, _) = start(false, Arc::new(AcknowledgeHandler)).await;
        let client = client(addr, 2, true);

        let messages: Vec<String> = (0..6).map(|i| format!("msg-{i}")).collect();
        let replies = join_all(messages.iter().map(|m| client.send(m))).await;

        for (message, reply) in messages.iter().zip(replies) {
            assert_eq!(reply.unwrap(), acknowledge(message));
        }
        assert_eq!(client.pool().available(), 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn kept_alive_connection_is_reused() {
        let (addr, shutdown, _) = start(true, Arc::new(AcknowledgeHandler)).await;
        let client = client(addr, 1, false);

        assert_eq!(client.send("one").await.unwrap(), acknowledge("one"));
        assert_eq!(client.pool().idle_count(), 1);
        assert_eq!(client.send("two").await.unwrap(), acknowledge("two"));
        assert_eq!(client.pool().idle_count(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn single_use_server_closes_after_reply() {
        let (addr, shutdown, _) = start(false, Arc::new(AcknowledgeHandler)).await;
        // pooled client, but the server hangs up after each reply
        let client = client(addr, 1, false);

        assert_eq!(client.send("one").await.unwrap(), acknowledge("one"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the parked connection is detected as closed and replaced
        assert_eq!(client.send("two").await.unwrap(), acknowledge("two"));
        shutdown.cancel();
    }

    /// Sleeps inside the handler so shutdown can land mid-exchange.
    struct SlowHandler {
        entered: tokio::sync::Notify,
        finished: AtomicBool,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, message: &str) -> ExchangeResult<String> {
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(acknowledge(message))
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_exchange() {
        let handler = Arc::new(SlowHandler { entered: tokio::sync::Notify::new(), finished: AtomicBool::new(false) });
        let (addr, shutdown, serving) = start(false, handler.clone()).await;

        let client = client(addr, 1, true);
        let call = tokio::spawn(async move { client.send("late").await });

        handler.entered.notified().await;
        shutdown.cancel();
        serving.await.unwrap();

        // serve only returns once the handler has run to completion
        assert!(handler.finished.load(Ordering::SeqCst));
        assert_eq!(call.await.unwrap().unwrap(), acknowledge("late"));
    }

    #[tokio::test]
    async fn shutdown_closes_idle_kept_alive_connections() {
        let (addr, shutdown, serving) = start(true, Arc::new(AcknowledgeHandler)).await;
        let client = client(addr, 1, false);
        assert_eq!(client.send("one").await.unwrap(), acknowledge("one"));
        assert_eq!(client.pool().idle_count(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .expect("idle connection must not hold up shutdown")
            .unwrap();
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn peers_reset_in_accept_queue_do_not_stall_the_listener() {
        let server = SecureServer::bind(&server_config(false), testkeys::server_store(), Arc::new(AcknowledgeHandler))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        // queue up connections that abort (RST) before they are accepted
        for _ in 0..30 {
            let socket = tokio::net::TcpSocket::new_v4().unwrap();
            socket.set_linger(Some(Duration::ZERO)).unwrap();
            drop(socket.connect(addr).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));

        let started = std::time::Instant::now();
        let reply = client(addr, 1, true).send("hello").await.unwrap();
        assert_eq!(reply, acknowledge("hello"));
        assert!(started.elapsed() < Duration::from_millis(1500), "took {:?}", started.elapsed());
        shutdown.cancel();
    }
}
