//! In-process test harness for the SMTP server
//!
//! Starts a real [`burner_mx::SmtpServer`] on an ephemeral localhost
//! port, backed by a [`burner_mx::MemoryStore`] and a temporary incoming
//! directory, and provides a minimal line-oriented client to talk to it.
//!
//! ## Module layout
//!
//! - `server` -- server bootstrap and the builder for its settings
//! - `client` -- raw SMTP client reading multi-line replies

#![allow(dead_code)]

mod client;
mod server;

pub use client::SmtpClient;
pub use server::{TestServer, TestServerBuilder};

use std::time::Duration;

/// Poll `condition` every 10ms until it holds, failing after 5 seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
