use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics::GaugeGuard;
use crate::server::session::{run_session, SessionContext};

struct TrackedSession {
    peer: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type SessionSet = Arc<Mutex<HashMap<u64, TrackedSession>>>;

/// Accepts connections and runs one session task per connection. Every live
/// session is tracked so shutdown can stop them all.
pub struct ConnectionServer {
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    ctx: SessionContext,
    sessions: SessionSet,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    grace: Duration,
}

impl ConnectionServer {
    pub async fn bind(addr: &str, ctx: SessionContext, grace: Duration) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            listener: parking_lot::Mutex::new(Some(listener)),
            local_addr,
            ctx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            shutdown_tx,
            grace,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Accept loop. Returns once [`shutdown`](Self::shutdown) is called; the
    /// listening socket is closed on return.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            warn!("connection server is already running or stopped");
            return Ok(());
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        info!(addr = %self.local_addr, "accepting connections");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
                        }
                        self.track(stream, peer).await;
                    }
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning.
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        info!("accept loop stopped");
        Ok(())
    }

    /// Register and spawn a session while holding the set lock, so the
    /// session cannot try to remove itself before it is registered.
    /// Connections that arrive once shutdown has begun are dropped unserved.
    async fn track(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        crate::metrics::CONNECTIONS_TOTAL.inc();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut sessions = self.sessions.lock().await;
        // Shutdown flips the flag before it drains the set under this lock.
        if self.is_stopping() {
            debug!(peer = %peer, "server stopping, dropping new connection");
            return;
        }
        let ctx = self.ctx.clone();
        let set = Arc::clone(&self.sessions);
        let shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let _active = GaugeGuard::new(&crate::metrics::ACTIVE_SESSIONS);
            let end = run_session(&ctx, stream, peer, stop_rx).await;
            crate::metrics::SESSION_ENDS_TOTAL
                .with_label_values(&[end.label()])
                .inc();
            info!(peer = %peer, end = ?end, "session ended");
            remove_session(&set, id, &shutdown).await;
        });
        sessions.insert(
            id,
            TrackedSession {
                peer,
                stop: stop_tx,
                task,
            },
        );
    }

    /// Stop accepting, tell every session to stop and wait up to the grace
    /// period for them to finish. Stragglers are aborted.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        let drained: Vec<TrackedSession> = {
            let mut sessions = self.sessions.lock().await;
            for session in sessions.values() {
                let _ = session.stop.send(true);
            }
            sessions.drain().map(|(_, s)| s).collect()
        };

        if drained.is_empty() {
            info!("connection server stopped");
            return;
        }

        info!(sessions = drained.len(), "stopping sessions");
        let aborts: Vec<_> = drained.iter().map(|s| (s.peer, s.task.abort_handle())).collect();
        let tasks = drained.into_iter().map(|s| s.task);
        if tokio::time::timeout(self.grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            for (peer, abort) in aborts {
                if !abort.is_finished() {
                    warn!(peer = %peer, "session did not stop within grace period, aborting");
                    abort.abort();
                }
            }
        }
        info!("connection server stopped");
    }
}

/// Idempotent. If the set is locked while the server is stopping, shutdown
/// owns removal and this returns without waiting.
async fn remove_session(sessions: &SessionSet, id: u64, shutdown: &watch::Receiver<bool>) {
    match sessions.try_lock() {
        Ok(mut set) => {
            set.remove(&id);
        }
        Err(_) if *shutdown.borrow() => {}
        Err(_) => {
            sessions.lock().await.remove(&id);
        }
    }
}
