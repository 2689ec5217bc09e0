//! Record store boundary
//!
//! The SMTP side only needs two things from persistence: the list of
//! mailboxes that are currently valid, and somewhere to put the metadata
//! of every accepted message. [`RecordStore`] captures exactly that.

use crate::content::ContentId;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Metadata of one message accepted by the SMTP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedMail {
    pub received_on: DateTime<Utc>,
    pub recipient: String,
    pub sender: String,
    pub content_size: u64,
    pub content_id: ContentId,
}

impl fmt::Display for AcceptedMail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Recipient={}, Sender={}, ContentSize={}, ContentId={}]",
            self.recipient, self.sender, self.content_size, self.content_id
        )
    }
}

/// A disposable mailbox and its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub token: Uuid,
    pub address: String,
    pub expires_on: DateTime<Utc>,
}

const CONSONANTS: &[u8] = b"bcdflmnprstv";
const VOWELS: &[u8] = b"aeiouy";
const LOCAL_PART_LETTERS: usize = 14;
const FIRST_NAME_LETTERS: usize = 6;

impl Mailbox {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_on
    }

    /// Mint a mailbox with a random, pronounceable address on one of
    /// `domains`, valid for `ttl` from now.
    ///
    /// Returns `None` if `domains` is empty.
    pub fn random<R: Rng + ?Sized>(domains: &[String], ttl: Duration, rng: &mut R) -> Option<Self> {
        let domain = domains.choose(rng)?;
        Some(Self {
            token: Uuid::new_v4(),
            address: format!("{}@{domain}", random_local_part(rng)),
            expires_on: Utc::now() + ttl,
        })
    }
}

/// `bobido.misapule`-style names: consonants on odd positions, vowels on
/// even ones, a dot after the first name.
fn random_local_part<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut name = String::with_capacity(LOCAL_PART_LETTERS + 1);
    for n in 1..=LOCAL_PART_LETTERS {
        let set = if n % 2 == 0 { VOWELS } else { CONSONANTS };
        name.push(char::from(set[rng.gen_range(0..set.len())]));
        if n == FIRST_NAME_LETTERS {
            name.push('.');
        }
    }
    name
}

/// Normalize addresses into the ascending, lowercase, duplicate-free
/// order the mailbox cache relies on.
pub fn normalize_addresses<I, S>(addresses: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = addresses
        .into_iter()
        .map(|a| a.as_ref().trim().to_lowercase())
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Persistence used by the mail dispatcher.
pub trait RecordStore: Send + Sync + 'static {
    /// Persist the metadata of an accepted message.
    fn insert_accepted_mail(&self, record: &AcceptedMail) -> impl Future<Output = Result<()>> + Send;

    /// Addresses of every mailbox still valid at `as_of`, ascending and
    /// lowercase.
    fn list_active_mailboxes(
        &self,
        as_of: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// In-process store, handy for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    mailboxes: Mutex<Vec<Mailbox>>,
    accepted: Mutex<Vec<AcceptedMail>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mailbox(&self, mailbox: Mailbox) {
        lock(&self.mailboxes).push(mailbox);
    }

    /// Convenience for adding an address that expires after `ttl`.
    pub fn add_address(&self, address: &str, ttl: Duration) {
        self.add_mailbox(Mailbox {
            token: Uuid::new_v4(),
            address: address.to_string(),
            expires_on: Utc::now() + ttl,
        });
    }

    /// Drop every mailbox with this address. Returns how many were removed.
    pub fn remove_address(&self, address: &str) -> usize {
        let mut mailboxes = lock(&self.mailboxes);
        let before = mailboxes.len();
        mailboxes.retain(|m| !m.address.eq_ignore_ascii_case(address));
        before - mailboxes.len()
    }

    /// Snapshot of everything persisted so far, in insertion order.
    #[must_use]
    pub fn accepted(&self) -> Vec<AcceptedMail> {
        lock(&self.accepted).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl RecordStore for MemoryStore {
    async fn insert_accepted_mail(&self, record: &AcceptedMail) -> Result<()> {
        lock(&self.accepted).push(record.clone());
        Ok(())
    }

    async fn list_active_mailboxes(&self, as_of: DateTime<Utc>) -> Result<Vec<String>> {
        let mailboxes = lock(&self.mailboxes);
        Ok(normalize_addresses(
            mailboxes
                .iter()
                .filter(|m| !m.is_expired(as_of))
                .map(|m| m.address.as_str()),
        ))
    }
}

const MAILBOXES_FILE: &str = "mailboxes.json";
const INCOMING_FILE: &str = "incoming.jsonl";
const LOCK_FILE: &str = "mailboxes.json.lock";
const LOCK_POLL: std::time::Duration = std::time::Duration::from_millis(20);
const LOCK_ATTEMPTS: u32 = 250;

/// Directory-backed store.
///
/// Mailboxes are kept as a JSON array in `mailboxes.json`; accepted
/// records are appended to `incoming.jsonl`, one JSON object per line.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mailboxes_path(&self) -> PathBuf {
        self.root.join(MAILBOXES_FILE)
    }

    #[must_use]
    pub fn incoming_path(&self) -> PathBuf {
        self.root.join(INCOMING_FILE)
    }

    /// Every mailbox on file, expired or not. A missing file is an empty
    /// store.
    pub async fn mailboxes(&self) -> Result<Vec<Mailbox>> {
        match tokio::fs::read(self.mailboxes_path()).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Store(format!(
                "Failed to read {}: {e}",
                self.mailboxes_path().display()
            ))),
        }
    }

    /// Add a mailbox to the mailbox file.
    ///
    /// The file is rewritten through a temporary sibling and renamed into
    /// place, so a concurrent reader sees either the old or the new list.
    /// Writers are serialized through `mailboxes.json.lock`; a lock left
    /// behind by a crashed writer has to be removed by hand.
    pub async fn add_mailbox(&self, mailbox: &Mailbox) -> Result<()> {
        let _lock = WriteLock::acquire(self.root.join(LOCK_FILE)).await?;
        let mut mailboxes = self.mailboxes().await?;
        mailboxes.push(mailbox.clone());

        let tmp = self.root.join(format!("{MAILBOXES_FILE}.{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&mailboxes)?).await?;
        tokio::fs::rename(&tmp, self.mailboxes_path()).await?;

        debug!("Added mailbox {}", mailbox.address);
        Ok(())
    }

    /// Every accepted record appended so far.
    pub async fn accepted(&self) -> Result<Vec<AcceptedMail>> {
        let raw = match tokio::fs::read_to_string(self.incoming_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Error::from))
            .collect()
    }
}

/// Exclusive lock file, removed on drop.
struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        for _ in 0..LOCK_ATTEMPTS {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Store(format!(
            "Timed out waiting for {}",
            path.display()
        )))
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {e}", self.path.display());
        }
    }
}

impl RecordStore for FileStore {
    async fn insert_accepted_mail(&self, record: &AcceptedMail) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.incoming_path())
            .await
            .map_err(|e| Error::Store(format!("Failed to open incoming log: {e}")))?;
        file.write_all(&line)
            .await
            .map_err(|e| Error::Store(format!("Failed to append record: {e}")))?;
        file.flush().await?;
        Ok(())
    }

    async fn list_active_mailboxes(&self, as_of: DateTime<Utc>) -> Result<Vec<String>> {
        let mailboxes = self.mailboxes().await?;
        Ok(normalize_addresses(
            mailboxes
                .iter()
                .filter(|m| !m.is_expired(as_of))
                .map(|m| m.address.as_str()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn record(recipient: &str) -> AcceptedMail {
        AcceptedMail {
            received_on: Utc::now(),
            recipient: recipient.to_string(),
            sender: "sender@example.org".to_string(),
            content_size: 42,
            content_id: ContentId::new(),
        }
    }

    #[test]
    fn normalize_sorts_lowercases_and_dedups() {
        let out = normalize_addresses(["b@x.io", " A@x.io", "a@X.io", "c@x.io"]);
        assert_eq!(out, vec!["a@x.io", "b@x.io", "c@x.io"]);
    }

    #[test]
    fn random_mailbox_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let domains = vec!["burner.test".to_string(), "spam.test".to_string()];
        let mailbox = Mailbox::random(&domains, Duration::minutes(30), &mut rng).unwrap();

        let (local, domain) = mailbox.address.split_once('@').unwrap();
        assert!(domains.iter().any(|d| d == domain));
        assert_eq!(local.len(), LOCAL_PART_LETTERS + 1);
        assert_eq!(local.as_bytes()[FIRST_NAME_LETTERS], b'.');

        let letters: Vec<u8> = local.bytes().filter(|&b| b != b'.').collect();
        for (i, b) in letters.iter().enumerate() {
            let expected = if i % 2 == 0 { CONSONANTS } else { VOWELS };
            assert!(expected.contains(b), "unexpected letter at {i} in {local}");
        }
        assert!(!mailbox.is_expired(Utc::now()));
        assert!(mailbox.is_expired(Utc::now() + Duration::minutes(31)));
    }

    #[test]
    fn random_mailbox_needs_a_domain() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(Mailbox::random(&[], Duration::minutes(1), &mut rng).is_none());
    }

    #[test]
    fn record_display() {
        let r = record("to@burner.test");
        let shown = r.to_string();
        assert!(shown.starts_with("[Recipient=to@burner.test, Sender=sender@example.org, ContentSize=42"));
    }

    #[tokio::test]
    async fn memory_store_filters_expired() {
        let store = MemoryStore::new();
        store.add_address("Live@Burner.test", Duration::minutes(5));
        store.add_address("gone@burner.test", Duration::minutes(-5));

        let active = store.list_active_mailboxes(Utc::now()).await.unwrap();
        assert_eq!(active, vec!["live@burner.test"]);

        assert_eq!(store.remove_address("live@burner.test"), 1);
        assert!(store.list_active_mailboxes(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.list_active_mailboxes(Utc::now()).await.unwrap().is_empty());

        let mut rng = StdRng::seed_from_u64(1);
        let domains = vec!["burner.test".to_string()];
        let live = Mailbox::random(&domains, Duration::minutes(10), &mut rng).unwrap();
        let mut expired = Mailbox::random(&domains, Duration::minutes(10), &mut rng).unwrap();
        expired.expires_on = Utc::now() - Duration::minutes(1);
        store.add_mailbox(&live).await.unwrap();
        store.add_mailbox(&expired).await.unwrap();

        assert_eq!(store.mailboxes().await.unwrap().len(), 2);
        assert_eq!(
            store.list_active_mailboxes(Utc::now()).await.unwrap(),
            vec![live.address.clone()]
        );

        let first = record(&live.address);
        let second = record(&live.address);
        store.insert_accepted_mail(&first).await.unwrap();
        store.insert_accepted_mail(&second).await.unwrap();
        assert_eq!(store.accepted().await.unwrap(), vec![first, second]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn file_store_concurrent_adds_keep_every_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let domains = vec!["burner.test".to_string()];

        let mut tasks = tokio::task::JoinSet::new();
        for seed in 0..8 {
            let store = store.clone();
            let mailbox =
                Mailbox::random(&domains, Duration::minutes(10), &mut StdRng::seed_from_u64(seed))
                    .unwrap();
            tasks.spawn(async move { store.add_mailbox(&mailbox).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.mailboxes().await.unwrap().len(), 8);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_mailbox_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(MAILBOXES_FILE), b"{ not json")
            .await
            .unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.list_active_mailboxes(Utc::now()).await.is_err());
    }
}
