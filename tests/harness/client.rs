//! Minimal SMTP client for driving the server by hand
//!
//! Replies are returned exactly as received, CRLFs included, so tests
//! can compare against the wire text. A multi-line reply (`250-...`)
//! is read up to and including its final `250 ...` line.

use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpClient {
    /// Connect and return the client together with the greeting.
    pub async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.expect("connect to server");
        let (read, write) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer: write,
        };
        let greeting = client.read_reply().await;
        (client, greeting)
    }

    /// Send one command line (CRLF appended) and read its reply.
    pub async fn command(&mut self, line: &str) -> String {
        self.send_raw(format!("{line}\r\n").as_bytes()).await;
        self.read_reply().await
    }

    /// Write bytes as-is, without waiting for anything.
    pub async fn send_raw(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.expect("write to server");
        self.writer.flush().await.expect("flush");
    }

    /// Read one complete, possibly multi-line, reply.
    pub async fn read_reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .expect("read reply line");
            assert!(n > 0, "connection closed mid-reply: {reply:?}");
            reply.push_str(&line);
            // "250-" continues, "250 " ends.
            if line.as_bytes().get(3) != Some(&b'-') {
                return reply;
            }
        }
    }

    /// Send a full message body after DATA's 354, dot-stuffing lines
    /// that start with a dot, and return the end-of-data reply.
    pub async fn send_body(&mut self, lines: &[&str]) -> String {
        let mut data = String::new();
        for line in lines {
            if line.starts_with('.') {
                data.push('.');
            }
            data.push_str(line);
            data.push_str("\r\n");
        }
        data.push_str(".\r\n");
        self.send_raw(data.as_bytes()).await;
        self.read_reply().await
    }

    /// Wait until the server closes the connection. Returns whatever was
    /// received before EOF.
    pub async fn read_to_close(&mut self) -> String {
        let mut rest = String::new();
        self.reader
            .read_to_string(&mut rest)
            .await
            .expect("read until close");
        rest
    }
}
