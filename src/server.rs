//! Connection acceptor and session lifecycle supervisor
//!
//! Every accepted connection runs as its own task. The [`SessionRegistry`]
//! tracks those tasks so a periodic sweep can reap the finished ones and
//! abort any that outlived the configured maximum lifetime, whatever the
//! dialog state.

use crate::config::SmtpSettings;
use crate::content::ContentStorage;
use crate::dispatch::MailDispatcher;
use crate::error::Result;
use crate::session::{Session, SessionContext, server_name};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

struct LiveSession {
    peer: SocketAddr,
    started: Instant,
    // Set once the task is spawned.
    handle: Option<AbortHandle>,
}

/// Set of sessions currently running.
#[derive(Default)]
pub struct SessionRegistry {
    live: Mutex<HashMap<u64, LiveSession>>,
    next_id: AtomicU64,
    removed: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the task built by `session` and track it.
    ///
    /// The task receives a [`SessionGuard`] that deregisters it when
    /// dropped, so it must keep the guard alive for as long as it runs.
    pub fn spawn<F, Fut>(self: &Arc<Self>, peer: SocketAddr, session: F) -> u64
    where
        F: FnOnce(SessionGuard) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = SessionGuard {
            id,
            registry: Arc::clone(self),
        };

        // Insert before spawning; never hold the lock across the spawn, a
        // runtime shutting down drops the future (and its guard) inline.
        self.lock().insert(
            id,
            LiveSession {
                peer,
                started: Instant::now(),
                handle: None,
            },
        );
        let handle = tokio::spawn(session(guard)).abort_handle();
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.handle = Some(handle);
        }
        id
    }

    /// Number of sessions still registered.
    #[must_use]
    pub fn live(&self) -> usize {
        self.lock().len()
    }

    /// Number of sessions deregistered so far.
    #[must_use]
    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    /// Reap finished sessions and abort the ones older than `max_lifetime`.
    /// Returns how many were aborted.
    pub fn sweep(&self, max_lifetime: Duration) -> usize {
        let expired: Vec<(u64, SocketAddr, AbortHandle)> = {
            let mut live = self.lock();
            let before = live.len();
            live.retain(|_, session| session.handle.as_ref().is_none_or(|h| !h.is_finished()));
            self.count_removed(before - live.len());

            live.iter()
                .filter(|(_, session)| session.started.elapsed() > max_lifetime)
                .filter_map(|(&id, session)| {
                    session.handle.clone().map(|handle| (id, session.peer, handle))
                })
                .collect()
        };

        // Aborted tasks drop their guard, which takes the lock again.
        for (id, peer, handle) in &expired {
            warn!("Aborting session {id} from {peer}: exceeded {max_lifetime:?}");
            handle.abort();
        }
        expired.len()
    }

    /// Abort every live session.
    pub fn abort_all(&self) {
        let handles: Vec<AbortHandle> = self
            .lock()
            .values()
            .filter_map(|s| s.handle.clone())
            .collect();
        for handle in handles {
            handle.abort();
        }
    }

    fn deregister(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            self.count_removed(1);
        }
    }

    fn count_removed(&self, n: usize) {
        self.removed
            .fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, LiveSession>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its session from the registry when dropped, whether the task
/// returned or was aborted.
pub struct SessionGuard {
    id: u64,
    registry: Arc<SessionRegistry>,
}

impl SessionGuard {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// The SMTP listener.
pub struct SmtpServer<S: ContentStorage> {
    settings: SmtpSettings,
    ctx: SessionContext<S>,
    registry: Arc<SessionRegistry>,
}

impl<S: ContentStorage> SmtpServer<S> {
    /// Sessions write bodies to `storage`, check recipients against the
    /// dispatcher's cache and enqueue accepted mail on its queue.
    pub fn new(settings: SmtpSettings, storage: Arc<S>, dispatcher: &MailDispatcher) -> Self {
        let ctx = SessionContext {
            storage,
            cache: Arc::clone(dispatcher.cache()),
            queue: dispatcher.queue().clone(),
            max_message_size: settings.max_message_size,
        };
        Self {
            settings,
            ctx,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.registry.live()
    }

    /// Accept connections on `listener` until `shutdown` is cancelled.
    ///
    /// Accept failures are logged and accepting resumes immediately. On
    /// shutdown every live session is aborted.
    ///
    /// # Errors
    ///
    /// Fails only if the listener's local address cannot be read.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        let listener_name = server_name(local);
        info!("SMTP server listening on {local} as {listener_name}");

        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&self.registry),
            self.settings.sweep_interval,
            self.settings.max_session_lifetime,
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // The address the client reached, not the wildcard.
                        let name = match stream.local_addr() {
                            Ok(addr) => server_name(addr),
                            Err(e) => {
                                warn!("Cannot read local address for {peer}: {e}");
                                listener_name.clone()
                            }
                        };
                        let session = Session::new(self.ctx.clone(), name);
                        let span = info_span!("session", %peer);
                        self.registry.spawn(peer, move |guard| {
                            async move {
                                debug!("Connection {} accepted", guard.id());
                                match session.run(stream).await {
                                    Ok(()) => debug!("Connection closed"),
                                    Err(e) => debug!("Connection ended: {e}"),
                                }
                                drop(guard);
                            }
                            .instrument(span)
                        });
                    }
                    Err(e) => warn!("Accept failed: {e}"),
                },
            }
        }

        if let Err(e) = sweeper.await {
            warn!("Sweep task failed: {e}");
        }
        self.registry.abort_all();
        info!("SMTP server stopped");
        Ok(())
    }
}

async fn sweep_loop(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    max_lifetime: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        let aborted = registry.sweep(max_lifetime);
        debug!(
            "Swept sessions: {} live, {aborted} aborted",
            registry.live()
        );
    }
}
