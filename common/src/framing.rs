//! Inbound message framing for the control connection.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for a single control message, matching the receive buffer.
pub const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One read is one message. Relies on the client sending one short
    /// message per write and waiting for the echo.
    #[default]
    Datagram,
    /// Newline-delimited messages; safe under fragmentation and coalescing.
    Lines,
}

impl Framing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Datagram => "datagram",
            Self::Lines => "lines",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown framing '{0}', expected 'datagram' or 'lines'")]
pub struct UnknownFraming(pub String);

impl FromStr for Framing {
    type Err = UnknownFraming;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "datagram" => Ok(Self::Datagram),
            "lines" => Ok(Self::Lines),
            _ => Err(UnknownFraming(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message exceeds {MAX_MESSAGE_LEN} bytes without a newline, dropped {dropped} bytes")]
pub struct Oversized {
    pub dropped: usize,
}

/// Incremental newline framer. Feed it whatever the socket returns and pull
/// complete messages out; the trailing `\n` (and a `\r` before it) is removed.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_MESSAGE_LEN),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Result<(), Oversized> {
        self.buf.extend_from_slice(data);
        let pending = match self.buf.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => self.buf.len() - last_newline - 1,
            None => self.buf.len(),
        };
        if pending > MAX_MESSAGE_LEN {
            let keep = self.buf.len() - pending;
            self.buf.truncate(keep);
            return Err(Oversized { dropped: pending });
        }
        Ok(())
    }

    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|b| *b == b'\n')?;
        let mut message: Vec<u8> = self.buf.drain(..=end).collect();
        message.pop();
        if message.last() == Some(&b'\r') {
            message.pop();
        }
        Some(message)
    }

    /// Bytes received after the last complete message.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn splits_coalesced_messages() {
        let mut framer = LineFramer::new();
        framer.push(b"HeatOn\nFanOn\r\nTemp=19").unwrap();

        assert_eq!(framer.next_message(), Some(b"HeatOn".to_vec()));
        assert_eq!(framer.next_message(), Some(b"FanOn".to_vec()));
        assert_eq!(framer.next_message(), None);
        assert_eq!(framer.pending(), 7);

        framer.push(b"0\n").unwrap();
        assert_eq!(framer.next_message(), Some(b"Temp=190".to_vec()));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn keeps_empty_lines() {
        let mut framer = LineFramer::new();
        framer.push(b"\n").unwrap();
        assert_eq!(framer.next_message(), Some(Vec::new()));
    }

    #[test]
    fn drops_oversized_partial_message() {
        let mut framer = LineFramer::new();
        framer.push(b"Ping\n").unwrap();
        let err = framer.push(&[b'x'; MAX_MESSAGE_LEN + 1]).unwrap_err();

        assert_eq!(err.dropped, MAX_MESSAGE_LEN + 1);
        assert_eq!(framer.next_message(), Some(b"Ping".to_vec()));
        assert_eq!(framer.next_message(), None);
    }

    #[test]
    fn parses_framing_names() {
        assert_eq!("Lines".parse::<Framing>().unwrap(), Framing::Lines);
        assert_eq!("datagram".parse::<Framing>().unwrap(), Framing::Datagram);
        assert!("json".parse::<Framing>().is_err());
    }
}
