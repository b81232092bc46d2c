//! The relay core.
//!
//! One dispatcher task drains the broker's three input queues and hands
//! typed envelopes to a fixed pool of workers over a single-slot channel.
//! The narrow hand-off is deliberate: when every worker is busy the
//! dispatcher blocks instead of reading ahead, so the broker itself holds
//! the overflow and restarts lose nothing.

pub mod pipelines;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::identity::Identity;
use crate::message::{Envelope, QueueTag};
use crate::twin::TwinResolver;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 1000;

/// How long the dispatcher blocks on the broker before running the retry
/// and scrub sweeps.
const NEXT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a broker error before polling again.
const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Minimum age before a failed send is promoted out of the retry hash.
pub(crate) const RETRY_QUANTUM: Duration = Duration::from_secs(5);

/// How long in-flight workers get to finish once shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>;

/// The node: identity, directory access, broker handle and worker pool.
/// Everything is shared by reference; messages flow by value.
pub struct App {
    pub(crate) twin: u32,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) resolver: Arc<dyn TwinResolver>,
    pub(crate) identity: Arc<Identity>,
    workers: usize,
}

impl App {
    pub fn new(
        backend: Arc<dyn Backend>,
        resolver: Arc<dyn TwinResolver>,
        identity: Arc<Identity>,
        twin: u32,
        workers: usize,
    ) -> Self {
        Self {
            twin,
            backend,
            resolver,
            identity,
            workers: workers.max(1),
        }
    }

    /// Own twin id.
    pub fn twin(&self) -> u32 {
        self.twin
    }

    /// Run the node until `cancel` fires: dispatcher, worker pool and the
    /// HTTP gateway. On cancellation the gateway stops accepting, the
    /// dispatcher exits at its next iteration and workers drain within the
    /// grace period.
    pub async fn serve(
        self: Arc<Self>,
        listen: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        tracing::info!(twin = self.twin, "initializing relay node");

        let (tx, rx) = mpsc::channel::<Envelope>(1);
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            workers.push(tokio::spawn(worker_loop(
                Arc::clone(&self),
                Arc::clone(&rx),
                cancel.clone(),
            )));
        }

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&self), tx, cancel.clone()));

        let router = crate::gateway::router(crate::gateway::AppState::new(Arc::clone(&self)));
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        let bound = listener.local_addr().context("failed to read bound address")?;
        tracing::info!("gateway listening on http://{bound}");

        let shutdown = cancel.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("gateway server failed")?;

        tracing::info!("shutting down relay");
        dispatcher.await.ok();

        let drain = async {
            for handle in workers {
                handle.await.ok();
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("workers did not drain within the shutdown grace period");
        }
        Ok(())
    }
}

/// Single-task drainer of the input queues. Maintenance (retry promotion,
/// backlog scrubbing) runs only on idle ticks, keeping all broker mutation
/// single-file.
async fn dispatch_loop(app: Arc<App>, tx: mpsc::Sender<Envelope>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            tracing::debug!("dispatcher stopping");
            return;
        }

        match app.backend.next(NEXT_TIMEOUT).await {
            Ok(Some(envelope)) => {
                if let Err(err) = envelope.message.validate() {
                    app.reject_invalid(envelope.message, &err).await;
                    continue;
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    sent = tx.send(envelope) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                if let Err(err) = app.handle_retry().await {
                    tracing::error!("retry sweep failed: {err:#}");
                }
                if let Err(err) = app.handle_scrubbing().await {
                    tracing::error!("backlog scrub failed: {err:#}");
                }
            }
            Err(err) => {
                tracing::error!("error fetching messages from broker: {err:#}");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(BROKER_ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

/// Workers are interchangeable; whichever is free takes the next envelope.
async fn worker_loop(app: Arc<App>, rx: SharedReceiver, cancel: CancellationToken) {
    loop {
        let envelope = {
            let mut rx = rx.lock().await;
            tokio::select! {
                () = cancel.cancelled() => return,
                received = rx.recv() => match received {
                    Some(envelope) => envelope,
                    None => return,
                },
            }
        };

        let result = match envelope.tag {
            QueueTag::Local => app.handle_from_local(envelope.message).await,
            QueueTag::Remote => app.handle_from_remote(envelope.message).await,
            QueueTag::Reply => app.handle_from_reply(envelope.message).await,
        };
        if let Err(err) = result {
            tracing::error!("failed to process message: {err:#}");
        }
    }
}
