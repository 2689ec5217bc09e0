//! SMTP replies
//!
//! The reply texts are part of the wire contract: test clients match on
//! them, so they are fixed here rather than composed ad hoc.

use crate::command::Verb;
use std::fmt::Write;

/// Every reply the server can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Greeting,
    Ok,
    Helo,
    Ehlo,
    SyntaxError(Verb),
    NotImplemented,
    UnknownCommand,
    BadSequence,
    Help,
    StartMailInput,
    Bye,
    NoSuchUser,
    MessageTooBig,
}

impl Reply {
    /// The three digit reply code.
    #[cfg(test)]
    const fn code(self) -> u16 {
        match self {
            Self::Greeting => 220,
            Self::Ok | Self::Helo | Self::Ehlo => 250,
            Self::SyntaxError(_) => 501,
            Self::NotImplemented => 502,
            Self::UnknownCommand => 500,
            Self::BadSequence => 503,
            Self::Help => 211,
            Self::StartMailInput => 354,
            Self::Bye => 221,
            Self::NoSuchUser => 550,
            Self::MessageTooBig => 552,
        }
    }

    /// Append the wire form of this reply, CRLF included, to `out`.
    ///
    /// `server_name` is the address literal the server identifies itself
    /// with; `max_message_size` is advertised in the EHLO `SIZE` line.
    pub fn write_to(self, out: &mut String, server_name: &str, max_message_size: u64) {
        // Writing into a String cannot fail.
        let _ = match self {
            Self::Greeting => write!(out, "220 {server_name} ESMTP ready.\r\n"),
            Self::Ok => write!(out, "250 OK\r\n"),
            Self::Helo => write!(out, "250 {server_name}\r\n"),
            Self::Ehlo => write!(
                out,
                "250-{server_name}\r\n250-8BITMIME\r\n250 SIZE {max_message_size}\r\n"
            ),
            Self::SyntaxError(verb) => write!(out, "501 {} syntax error\r\n", verb.as_str()),
            Self::NotImplemented => write!(out, "502 Command not implemented\r\n"),
            Self::UnknownCommand => write!(out, "500 Unknown command\r\n"),
            Self::BadSequence => write!(out, "503 Bad sequence of command\r\n"),
            Self::Help => write!(out, "211 You don't need help\r\n"),
            Self::StartMailInput => {
                write!(out, "354 Start mail input; end with <CRLF>.<CRLF>\r\n")
            }
            Self::Bye => write!(out, "221 Bye\r\n"),
            Self::NoSuchUser => write!(out, "550 No such user here\r\n"),
            Self::MessageTooBig => write!(out, "552 Message size exceeds maximum permitted\r\n"),
        };
    }

    #[cfg(test)]
    fn render(self, server_name: &str, max_message_size: u64) -> String {
        let mut out = String::new();
        self.write_to(&mut out, server_name, max_message_size);
        out
    }
}
