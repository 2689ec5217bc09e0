//! SMTP ingress for disposable mailboxes
//!
//! A small, hand-built SMTP server that accepts mail only for
//! short-lived, randomly generated addresses. Each connection is driven
//! by a [`Session`] state machine that streams the message body to
//! [`ContentStorage`] and, on success, hands an [`AcceptedMail`] record to
//! the [`MailDispatcher`], which persists it to a [`RecordStore`] in the
//! background.
//!
//! Recipients are checked against a [`MailboxCache`] that is refreshed
//! from the record store on a timer, so a new or expired mailbox becomes
//! visible to SMTP clients within one refresh interval.
//!
//! ```no_run
//! use burner_mx::{Config, DirectoryStorage, FileStore, MailDispatcher, SmtpServer};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> burner_mx::Result<()> {
//! let config = Config::from_env()?;
//! let shutdown = CancellationToken::new();
//!
//! let store = Arc::new(FileStore::new(&config.store_dir));
//! let dispatcher = MailDispatcher::start(store, &config.dispatch, shutdown.clone());
//!
//! let storage = Arc::new(DirectoryStorage::new(&config.incoming_dir));
//! let server = SmtpServer::new(config.smtp.clone(), storage, &dispatcher);
//!
//! let listener = tokio::net::TcpListener::bind(config.listen).await?;
//! server.serve(listener, shutdown).await?;
//! dispatcher.join().await;
//! # Ok(())
//! # }
//! ```

pub mod bytes;
mod command;
mod config;
mod content;
mod dispatch;
mod error;
mod reply;
mod server;
mod session;
mod store;

pub use command::Verb;
pub use config::{Config, DEFAULT_MAX_MESSAGE_SIZE, DispatchSettings, SmtpSettings};
pub use content::{ContentId, ContentStorage, DirectoryStorage};
pub use dispatch::{ActiveMailboxes, DispatchQueue, MailDispatcher, MailboxCache};
pub use error::{Error, Result};
pub use reply::Reply;
pub use server::{SessionGuard, SessionRegistry, SmtpServer};
pub use session::{Session, SessionContext, State, server_name};
pub use store::{AcceptedMail, FileStore, Mailbox, MemoryStore, RecordStore};
