//! Per-connection SMTP state machine
//!
//! A [`Session`] owns everything about one connection: the re-assembly
//! buffer, the protocol state and the current transaction. It is driven
//! by exactly one task, so none of it needs locking.
//!
//! Input is processed in batches: whatever bytes arrived are appended to
//! the buffer, every complete CRLF-terminated line is handled in order,
//! and the leftover partial line is moved to the front for the next read.
//! Replies produced by a batch are collected and written back together.

use crate::bytes::{self, index_of};
use crate::command::{DeclaredSize, Verb, WHITESPACE, address_at, find_path, parse_size};
use crate::content::{ContentId, ContentStorage};
use crate::dispatch::{DispatchQueue, MailboxCache};
use crate::error::Result;
use crate::reply::Reply;
use crate::store::AcceptedMail;
use chrono::Utc;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

const CRLF: &[u8] = b"\r\n";
const END_OF_DATA: &[u8] = b".\r\n";

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8192;
/// Sink buffer when the client did not declare a size.
const DEFAULT_SINK_SIZE: usize = 4096;
/// Added to a declared size when sizing the sink buffer.
const SINK_SLACK: u64 = 1024;

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Just accepted, greeting not sent yet.
    AwaitingGreetingReply,
    AwaitingHello,
    AwaitingSender,
    AwaitingRecipient,
    AwaitingMoreRecipientsOrData,
    /// Every line is body content until `.` CRLF.
    AwaitingDataTermination,
    /// Entered after an oversize rejection. Only RSET starts over.
    AwaitingReset,
    Disconnecting,
}

/// Shared collaborators every session needs.
pub struct SessionContext<S> {
    pub storage: Arc<S>,
    pub cache: Arc<MailboxCache>,
    pub queue: DispatchQueue,
    pub max_message_size: u64,
}

impl<S> Clone for SessionContext<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            cache: Arc::clone(&self.cache),
            queue: self.queue.clone(),
            max_message_size: self.max_message_size,
        }
    }
}

/// Body being received during DATA.
struct Body<W> {
    id: ContentId,
    writer: W,
}

/// One MAIL FROM .. end-of-data exchange.
struct Transaction<W> {
    sender: String,
    recipient: Option<String>,
    expected_size: Option<u64>,
    body: Option<Body<W>>,
    /// Body bytes seen so far after dot-unstuffing, written or not.
    received: u64,
}

impl<W> Default for Transaction<W> {
    fn default() -> Self {
        Self {
            sender: String::new(),
            recipient: None,
            expected_size: None,
            body: None,
            received: 0,
        }
    }
}

pub struct Session<S: ContentStorage> {
    ctx: SessionContext<S>,
    server_name: String,
    state: State,
    buffer: Vec<u8>,
    txn: Transaction<S::Sink>,
}

impl<S: ContentStorage> Session<S> {
    /// `server_name` is what the greeting and HELO/EHLO replies identify
    /// the server as, see [`server_name`].
    pub fn new(ctx: SessionContext<S>, server_name: impl Into<String>) -> Self {
        Self {
            ctx,
            server_name: server_name.into(),
            state: State::AwaitingGreetingReply,
            buffer: Vec::new(),
            txn: Transaction::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Write the greeting and move to `AwaitingHello`.
    pub fn greet(&mut self, out: &mut String) {
        if self.state == State::AwaitingGreetingReply {
            self.reply(Reply::Greeting, out);
            self.state = State::AwaitingHello;
        }
    }

    /// Drive the whole dialog over `stream` until QUIT, peer disconnect or
    /// an I/O error.
    ///
    /// # Errors
    ///
    /// Returns transport errors and content storage failures. Protocol
    /// errors are answered on the wire and never surface here.
    pub async fn run<IO>(mut self, mut stream: IO) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut out = String::new();
        self.greet(&mut out);
        stream.write_all(out.as_bytes()).await?;

        let mut chunk = vec![0u8; READ_CHUNK];
        while self.state != State::Disconnecting {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                debug!("Peer closed connection in state {:?}", self.state);
                return Ok(());
            }

            out.clear();
            let handled = self.receive(&chunk[..n], &mut out).await;
            if !out.is_empty() {
                stream.write_all(out.as_bytes()).await?;
            }
            handled?;
        }

        stream.shutdown().await.ok();
        Ok(())
    }

    /// Feed received bytes and collect the replies they produce in `out`.
    ///
    /// Bytes after a QUIT in the same batch are ignored.
    ///
    /// # Errors
    ///
    /// Fails when the content sink cannot be created or written.
    pub async fn receive(&mut self, data: &[u8], out: &mut String) -> Result<()> {
        self.buffer.extend_from_slice(data);
        let mut buffer = mem::take(&mut self.buffer);

        let mut start = 0;
        let mut handled = Ok(());
        while self.state != State::Disconnecting {
            let Some(at) = index_of(CRLF, &buffer[start..]) else {
                break;
            };
            let end = start + at + CRLF.len();
            handled = self.handle_line(&mut buffer[start..end], out).await;
            if handled.is_err() {
                break;
            }
            start = end;
        }

        buffer.drain(..start);
        self.buffer = buffer;
        handled
    }

    async fn handle_line(&mut self, line: &mut [u8], out: &mut String) -> Result<()> {
        if self.state == State::AwaitingDataTermination {
            return self.body_line(line, out).await;
        }

        let mut tokens = bytes::split(line, WHITESPACE);
        let verb = tokens.next().map(Verb::parse);
        let arity = usize::from(verb.is_some()) + tokens.count();

        let Some(Some(verb)) = verb else {
            trace!("Unknown command: {:?}", String::from_utf8_lossy(line).trim_end());
            self.reply(Reply::UnknownCommand, out);
            return Ok(());
        };
        trace!("{} in state {:?}", verb.as_str(), self.state);

        match (verb, self.state) {
            (Verb::Rset, _) => {
                if arity == 1 {
                    self.abandon().await;
                    self.state = State::AwaitingHello;
                    self.reply(Reply::Ok, out);
                } else {
                    self.reply(Reply::SyntaxError(verb), out);
                }
            }
            (Verb::Quit, _) => {
                if arity == 1 {
                    self.abandon().await;
                    self.state = State::Disconnecting;
                    self.reply(Reply::Bye, out);
                } else {
                    self.reply(Reply::SyntaxError(verb), out);
                }
            }
            (Verb::Noop, _) => self.reply(Reply::Ok, out),
            (Verb::Help, _) => self.reply(Reply::Help, out),
            (Verb::Vrfy | Verb::Expn, _) => self.reply(Reply::NotImplemented, out),
            (Verb::Helo | Verb::Ehlo, State::AwaitingHello) => {
                if arity == 2 {
                    self.state = State::AwaitingSender;
                    let reply = if verb == Verb::Ehlo {
                        Reply::Ehlo
                    } else {
                        Reply::Helo
                    };
                    self.reply(reply, out);
                } else {
                    self.reply(Reply::SyntaxError(verb), out);
                }
            }
            (Verb::Mail, State::AwaitingSender) => self.mail(line, out),
            (Verb::Rcpt, State::AwaitingRecipient | State::AwaitingMoreRecipientsOrData) => {
                self.rcpt(line, out);
            }
            (Verb::Data, State::AwaitingMoreRecipientsOrData) => {
                if arity == 1 {
                    self.data(out).await?;
                } else {
                    self.reply(Reply::SyntaxError(verb), out);
                }
            }
            _ => self.reply(Reply::BadSequence, out),
        }
        Ok(())
    }

    fn mail(&mut self, line: &mut [u8], out: &mut String) {
        let Some(span) = find_path(line) else {
            self.reply(Reply::SyntaxError(Verb::Mail), out);
            return;
        };
        let sender = address_at(line, &span);

        let max = self.ctx.max_message_size;
        let expected_size = match parse_size(&mut line[span.params_start..], max) {
            DeclaredSize::Malformed => {
                self.reply(Reply::SyntaxError(Verb::Mail), out);
                return;
            }
            DeclaredSize::Bytes(size) if size > max => {
                debug!("Declared size {size} over limit from <{sender}>");
                self.state = State::AwaitingReset;
                self.reply(Reply::MessageTooBig, out);
                return;
            }
            DeclaredSize::Bytes(size) => Some(size),
            DeclaredSize::Unknown => None,
        };

        self.txn = Transaction {
            sender,
            expected_size,
            ..Transaction::default()
        };
        self.state = State::AwaitingRecipient;
        self.reply(Reply::Ok, out);
    }

    fn rcpt(&mut self, line: &[u8], out: &mut String) {
        let Some(span) = find_path(line) else {
            self.reply(Reply::SyntaxError(Verb::Rcpt), out);
            return;
        };
        let recipient = address_at(line, &span).to_lowercase();

        if !self.ctx.cache.is_active(&recipient) {
            debug!("Rejecting unknown recipient <{recipient}>");
            self.reply(Reply::NoSuchUser, out);
            return;
        }

        // Only the last accepted recipient is kept.
        self.txn.recipient = Some(recipient);
        self.state = State::AwaitingMoreRecipientsOrData;
        self.reply(Reply::Ok, out);
    }

    async fn data(&mut self, out: &mut String) -> Result<()> {
        let size_hint = self
            .txn
            .expected_size
            .and_then(|size| usize::try_from(size.saturating_add(SINK_SLACK)).ok())
            .unwrap_or(DEFAULT_SINK_SIZE);

        let id = ContentId::new();
        let writer = self.ctx.storage.create_sink(&id, size_hint).await?;
        self.txn.body = Some(Body { id, writer });
        self.txn.received = 0;

        self.state = State::AwaitingDataTermination;
        self.reply(Reply::StartMailInput, out);
        Ok(())
    }

    async fn body_line(&mut self, line: &[u8], out: &mut String) -> Result<()> {
        if bytes::is_same(END_OF_DATA, line) {
            return self.end_of_data(out).await;
        }

        let content = match line.first() {
            Some(b'.') => &line[1..],
            _ => line,
        };
        let len = u64::try_from(content.len()).unwrap_or(u64::MAX);
        self.txn.received = self.txn.received.saturating_add(len);

        // Past the limit bytes are only counted, so the terminator is
        // still found.
        if self.txn.received <= self.ctx.max_message_size
            && let Some(body) = self.txn.body.as_mut()
        {
            body.writer.write_all(content).await?;
        }
        Ok(())
    }

    async fn end_of_data(&mut self, out: &mut String) -> Result<()> {
        let txn = mem::take(&mut self.txn);

        if txn.received > self.ctx.max_message_size {
            debug!("Message of {} bytes over limit", txn.received);
            if let Some(body) = txn.body {
                self.discard(body).await;
            }
            self.state = State::AwaitingReset;
            self.reply(Reply::MessageTooBig, out);
            return Ok(());
        }

        let (Some(mut body), Some(recipient)) = (txn.body, txn.recipient) else {
            warn!("End of data without an open transaction");
            self.state = State::AwaitingHello;
            self.reply(Reply::BadSequence, out);
            return Ok(());
        };
        body.writer.shutdown().await?;

        let record = AcceptedMail {
            received_on: Utc::now(),
            recipient,
            sender: txn.sender,
            content_size: txn.received,
            content_id: body.id,
        };
        info!("Accepted {record}");
        self.ctx.queue.enqueue(record);

        self.state = State::AwaitingSender;
        self.reply(Reply::Ok, out);
        Ok(())
    }

    /// Drop the current transaction, deleting a partially written body.
    async fn abandon(&mut self) {
        if let Some(body) = mem::take(&mut self.txn).body {
            self.discard(body).await;
        }
    }

    async fn discard(&mut self, body: Body<S::Sink>) {
        drop(body.writer);
        if let Err(e) = self.ctx.storage.remove(&body.id).await {
            warn!("Could not remove partial body {}: {e}", body.id);
        }
    }

    fn reply(&self, reply: Reply, out: &mut String) {
        reply.write_to(out, &self.server_name, self.ctx.max_message_size);
    }
}

/// Address literal a server bound to `local` identifies itself with.
#[must_use]
pub fn server_name(local: SocketAddr) -> String {
    match local.ip() {
        IpAddr::V4(ip) => format!("[{ip}]"),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => format!("[{v4}]"),
            None => format!("[IPv6:{ip}]"),
        },
    }
}
