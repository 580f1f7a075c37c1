// TLS listener that performs the handshake and spawns client sessions

use crate::chat::config::ServerConfig;
use crate::chat::registry::Registry;
use crate::chat::router::Router;
use crate::chat::session::serve_connection;
use crate::chat::storage::{HistoryLog, StatusStore};
use crate::chat::tls;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// A bound chat relay, ready to accept connections
pub struct ChatServer {
    config: Arc<ServerConfig>,
    router: Arc<Router>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
}

impl ChatServer {
    /// Prepare TLS material and stores, then bind the listener
    ///
    /// Certificate and bind failures are fatal. An unusable history log only
    /// disables durable history.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let generated = tls::ensure_certificate(&config.cert_path, &config.key_path)
            .context("Failed to prepare TLS certificate")?;
        if generated {
            tracing::info!("🔐 Generated self-signed certificate {:?}", config.cert_path);
        } else {
            tracing::info!("🔐 Using certificate {:?}", config.cert_path);
        }
        let acceptor = tls::acceptor(&config.cert_path, &config.key_path)?;

        let history = match HistoryLog::open(&config.history_path, config.history_policy) {
            Ok(history) => Some(Arc::new(history)),
            Err(e) => {
                tracing::warn!("Running without durable history: {:#}", e);
                None
            }
        };

        let store = Arc::new(StatusStore::new(&config.status_path));
        let registry = Arc::new(Registry::with_store(
            store,
            config.outbound_capacity,
            config.typing_window,
        ));
        let router = Arc::new(Router::new(registry, history, config.replay_limit));

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

        Ok(Self {
            config: Arc::new(config),
            router,
            acceptor,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Accept connections until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("📡 Chat relay listening on {}", self.local_addr()?);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_session(stream, addr),
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Listener shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let acceptor = self.acceptor.clone();
        let router = self.router.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    serve_connection(tls_stream, addr.to_string(), router, config).await;
                }
                Err(e) => tracing::warn!("TLS handshake with {} failed: {}", addr, e),
            }
        });
    }
}
