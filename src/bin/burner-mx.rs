#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Disposable mailbox MX server and operator tools

use anyhow::Context;
use burner_mx::{
    AcceptedMail, Config, DirectoryStorage, FileStore, MailDispatcher, Mailbox, SmtpServer,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burner-mx")]
#[command(about = "SMTP ingress for short-lived disposable mailboxes")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Accept mail until interrupted
    Serve,

    /// Create random mailboxes in the record store
    Mint {
        /// Number of mailboxes to create
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Show accepted mail records
    Incoming {
        /// Maximum number of records to show, most recent first
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    match &args.command {
        Command::Serve => cmd_serve(config).await?,
        Command::Mint { count } => cmd_mint(&config, &args, *count).await?,
        Command::Incoming { limit } => cmd_incoming(&config, &args, *limit).await?,
    }

    Ok(())
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    let shutdown = CancellationToken::new();
    let store = Arc::new(FileStore::new(&config.store_dir));
    let dispatcher = MailDispatcher::start(store, &config.dispatch, shutdown.clone());
    let storage = Arc::new(DirectoryStorage::new(&config.incoming_dir));
    let server = SmtpServer::new(config.smtp.clone(), storage, &dispatcher);

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            return;
        }
        info!("Shutting down");
        ctrl_c.cancel();
    });

    server.serve(listener, shutdown).await?;
    dispatcher.join().await;
    Ok(())
}

async fn cmd_mint(config: &Config, args: &Args, count: usize) -> anyhow::Result<()> {
    let store = FileStore::new(&config.store_dir);
    let mut minted = Vec::with_capacity(count);

    for _ in 0..count {
        let mailbox = Mailbox::random(
            &config.mail_domains,
            config.mailbox_ttl(),
            &mut rand::thread_rng(),
        )
        .context("No mail domain configured")?;
        store.add_mailbox(&mailbox).await?;
        minted.push(mailbox);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&minted)?);
    } else {
        for mailbox in &minted {
            println!(
                "{:<40} expires {}",
                mailbox.address,
                mailbox.expires_on.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    Ok(())
}

async fn cmd_incoming(config: &Config, args: &Args, limit: usize) -> anyhow::Result<()> {
    let store = FileStore::new(&config.store_dir);
    let records = store.accepted().await?;
    let display: Vec<&AcceptedMail> = records.iter().rev().take(limit).collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&display)?);
    } else {
        print_incoming_table(&display);
    }

    Ok(())
}

fn print_incoming_table(records: &[&AcceptedMail]) {
    if records.is_empty() {
        println!("No mail accepted yet.");
        return;
    }

    let header = format!(
        "{:<20} {:<30} {:<30} {:>8}",
        "Received", "Recipient", "Sender", "Bytes"
    );
    println!("{header}");
    println!("{}", "-".repeat(92));

    for record in records {
        println!(
            "{:<20} {:<30} {:<30} {:>8}",
            record.received_on.format("%Y-%m-%d %H:%M"),
            truncate(&record.recipient, 28),
            truncate(&record.sender, 28),
            record.content_size,
        );
    }

    println!("\n{} record(s)", records.len());
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
