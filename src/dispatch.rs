//! Mailbox cache and accepted-mail dispatch
//!
//! Two background loops live here:
//!
//! - the **refresher** periodically rebuilds the set of active mailbox
//!   addresses from the record store and swaps it into [`MailboxCache`];
//!   sessions consult the cache synchronously during `RCPT TO`.
//! - the **persister** drains the [`DispatchQueue`] and writes every
//!   accepted-mail record to the store.
//!
//! Staleness is preferred over unavailability: a failed refresh keeps the
//! previous snapshot, so a mailbox created or expired between refreshes
//! can be wrongly rejected or accepted for up to one refresh interval.
//!
//! The queue is unbounded and lives only in memory. Records survive store
//! outages (they stay queued and are retried in order) but are lost if
//! the process dies before they are persisted.

use crate::config::DispatchSettings;
use crate::error::Result;
use crate::store::{AcceptedMail, RecordStore, normalize_addresses};
use arc_swap::ArcSwap;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Immutable, sorted set of lowercase addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveMailboxes {
    addresses: Vec<String>,
}

impl ActiveMailboxes {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            addresses: normalize_addresses(addresses),
        }
    }

    /// Binary search; `address` must already be lowercase.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.addresses
            .binary_search_by(|probe| probe.as_str().cmp(address))
            .is_ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Read-mostly view of which recipients are currently accepted.
///
/// Readers load the current snapshot without blocking; a refresh builds a
/// new snapshot off to the side and swaps it in whole.
#[derive(Debug, Default)]
pub struct MailboxCache {
    snapshot: ArcSwap<ActiveMailboxes>,
}

impl MailboxCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_active(&self, address: &str) -> bool {
        let address = address.trim().to_lowercase();
        self.snapshot.load().contains(&address)
    }

    /// The snapshot readers currently see.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ActiveMailboxes> {
        self.snapshot.load_full()
    }

    pub fn replace(&self, snapshot: ActiveMailboxes) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Rebuild the snapshot from `store`. On error the previous snapshot
    /// stays in place. Returns the number of active addresses.
    pub async fn refresh<S: RecordStore>(&self, store: &S) -> Result<usize> {
        let addresses = store.list_active_mailboxes(Utc::now()).await?;
        let snapshot = ActiveMailboxes::new(addresses);
        let count = snapshot.len();
        self.replace(snapshot);
        Ok(count)
    }
}

/// Producer side of the accepted-mail queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: UnboundedSender<AcceptedMail>,
}

impl DispatchQueue {
    /// Create a queue and the receiver its single consumer drains.
    #[must_use]
    pub fn channel() -> (Self, UnboundedReceiver<AcceptedMail>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand a record to the persister. Never blocks.
    pub fn enqueue(&self, record: AcceptedMail) {
        if let Err(e) = self.tx.send(record) {
            // Only possible once the persister is gone during shutdown.
            error!("Dropping accepted mail {}: dispatcher stopped", e.0);
        }
    }
}

/// Owns the mailbox cache, the dispatch queue and the two loops feeding
/// them.
pub struct MailDispatcher {
    cache: Arc<MailboxCache>,
    queue: DispatchQueue,
    tasks: Vec<JoinHandle<()>>,
}

impl MailDispatcher {
    /// Spawn the refresher and persister on the current runtime.
    ///
    /// Both loops stop when `shutdown` is cancelled; the persister makes a
    /// last attempt at whatever is still queued first.
    pub fn start<S: RecordStore>(
        store: Arc<S>,
        settings: &DispatchSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let cache = Arc::new(MailboxCache::new());
        let (queue, rx) = DispatchQueue::channel();

        let refresher = tokio::spawn(refresh_loop(
            Arc::clone(&cache),
            Arc::clone(&store),
            settings.refresh_interval,
            shutdown.clone(),
        ));
        let persister = tokio::spawn(persist_loop(
            rx,
            store,
            settings.queue_wait,
            settings.retry_backoff,
            shutdown,
        ));

        info!("Mail dispatcher started");
        Self {
            cache,
            queue,
            tasks: vec![refresher, persister],
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<MailboxCache> {
        &self.cache
    }

    #[must_use]
    pub const fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Wait for both loops to finish. Call after cancelling the shutdown
    /// token passed to [`MailDispatcher::start`].
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Dispatcher task failed: {e}");
            }
        }
    }
}

async fn refresh_loop<S: RecordStore>(
    cache: Arc<MailboxCache>,
    store: Arc<S>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        match cache.refresh(store.as_ref()).await {
            Ok(count) => debug!("Mailbox cache refreshed: {count} active"),
            Err(e) => warn!("Mailbox cache refresh failed, keeping previous snapshot: {e}"),
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Mailbox cache refresher stopped");
}

/// Single consumer of the dispatch queue.
///
/// A record that fails to persist is held at the head and retried after
/// `backoff`, so ordering is preserved across store outages.
pub async fn persist_loop<S: RecordStore>(
    mut rx: UnboundedReceiver<AcceptedMail>,
    store: Arc<S>,
    wait: Duration,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    let mut pending: Option<AcceptedMail> = None;

    loop {
        let record = match pending.take() {
            Some(record) => record,
            None => {
                let next = tokio::select! {
                    () = shutdown.cancelled() => break,
                    next = tokio::time::timeout(wait, rx.recv()) => next,
                };
                match next {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        debug!("Dispatch queue closed");
                        return;
                    }
                    Err(_) => {
                        trace!("Dispatch queue idle");
                        continue;
                    }
                }
            }
        };

        match store.insert_accepted_mail(&record).await {
            Ok(()) => debug!("Persisted accepted mail {record}"),
            Err(e) => {
                warn!("Failed to persist accepted mail, retrying in {backoff:?}: {e}");
                pending = Some(record);
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    drain(rx, pending, store.as_ref()).await;
}

/// Last pass over the queue at shutdown: one attempt per record.
async fn drain<S: RecordStore>(
    mut rx: UnboundedReceiver<AcceptedMail>,
    pending: Option<AcceptedMail>,
    store: &S,
) {
    rx.close();
    let mut lost = 0usize;
    let mut next = pending;
    loop {
        let Some(record) = next.take().or_else(|| rx.try_recv().ok()) else {
            break;
        };
        if let Err(e) = store.insert_accepted_mail(&record).await {
            warn!("Could not persist {record} at shutdown: {e}");
            lost += 1;
        }
    }
    if lost > 0 {
        error!("{lost} accepted mail record(s) lost at shutdown");
    }
    debug!("Mail persister stopped");
}
