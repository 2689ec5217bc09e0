//! Test server bootstrap
//!
//! ```ignore
//! let server = TestServer::builder()
//!     .mailbox("box@burner.test")
//!     .max_message_size(1024)
//!     .start()
//!     .await;
//! ```
//!
//! Mailboxes added through the builder are loaded into the cache before
//! `start` returns, so tests never race the first refresh. The periodic
//! refresh is slow by default; tests that care about staleness call
//! [`TestServer::refresh`] explicitly.

use super::wait_for;
use burner_mx::{
    AcceptedMail, DirectoryStorage, DispatchSettings, MailDispatcher, MemoryStore, SmtpServer,
    SmtpSettings,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct TestServerBuilder {
    mailboxes: Vec<String>,
    bind: SocketAddr,
    smtp: SmtpSettings,
    dispatch: DispatchSettings,
}

impl TestServerBuilder {
    /// Register an active mailbox valid for an hour.
    pub fn mailbox(mut self, address: &str) -> Self {
        self.mailboxes.push(address.to_string());
        self
    }

    /// Listen on `addr` instead of an ephemeral localhost port.
    pub const fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    pub const fn max_message_size(mut self, bytes: u64) -> Self {
        self.smtp.max_message_size = bytes;
        self
    }

    pub const fn session_lifetime(mut self, lifetime: Duration) -> Self {
        self.smtp.max_session_lifetime = lifetime;
        self
    }

    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.smtp.sweep_interval = interval;
        self
    }

    pub async fn start(self) -> TestServer {
        let store = Arc::new(MemoryStore::new());
        for address in &self.mailboxes {
            store.add_address(address, chrono::Duration::hours(1));
        }

        let incoming = tempfile::tempdir().expect("create incoming dir");
        let shutdown = CancellationToken::new();

        let dispatcher =
            MailDispatcher::start(Arc::clone(&store), &self.dispatch, shutdown.clone());
        dispatcher
            .cache()
            .refresh(store.as_ref())
            .await
            .expect("initial cache refresh");

        let storage = Arc::new(DirectoryStorage::new(incoming.path()));
        let server = Arc::new(SmtpServer::new(self.smtp, storage, &dispatcher));

        let listener = TcpListener::bind(self.bind)
            .await
            .expect("bind to ephemeral port");
        let addr = listener.local_addr().unwrap();

        let serving = Arc::clone(&server);
        let token = shutdown.clone();
        tokio::spawn(async move {
            serving.serve(listener, token).await.expect("serve");
        });

        TestServer {
            addr,
            store,
            incoming,
            server,
            dispatcher,
            shutdown,
        }
    }
}

/// A running server. Stops when dropped.
pub struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    incoming: TempDir,
    server: Arc<SmtpServer<DirectoryStorage>>,
    dispatcher: MailDispatcher,
    shutdown: CancellationToken,
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder {
            mailboxes: Vec::new(),
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            smtp: SmtpSettings::default(),
            dispatch: DispatchSettings {
                refresh_interval: Duration::from_secs(3600),
                queue_wait: Duration::from_millis(100),
                retry_backoff: Duration::from_millis(50),
            },
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn live_sessions(&self) -> usize {
        self.server.live_sessions()
    }

    pub fn removed_sessions(&self) -> u64 {
        self.server.registry().removed()
    }

    /// Reload the mailbox cache from the store now.
    pub async fn refresh(&self) {
        self.dispatcher
            .cache()
            .refresh(self.store.as_ref())
            .await
            .expect("cache refresh");
    }

    /// Wait until the persister has stored `count` records.
    pub async fn wait_for_records(&self, count: usize) -> Vec<AcceptedMail> {
        wait_for(|| self.store.accepted().len() >= count).await;
        self.store.accepted()
    }

    /// Path of the stored body of `record`.
    pub fn body_path(&self, record: &AcceptedMail) -> PathBuf {
        self.incoming.path().join(record.content_id.to_string())
    }

    pub fn body(&self, record: &AcceptedMail) -> Vec<u8> {
        std::fs::read(self.body_path(record)).expect("read stored body")
    }

    /// Names of every file in the incoming directory.
    pub fn incoming_files(&self) -> Vec<String> {
        std::fs::read_dir(self.incoming.path())
            .expect("list incoming dir")
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
