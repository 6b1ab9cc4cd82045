use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

/// Payload prefix that asks the server to drop the sending connection.
pub const EXIT_COMMAND: &[u8] = b"exit";

/// Server-assigned identifier of one connection. Never reused within a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One frame travelling through the queue: either chat bytes forwarded
/// verbatim or a server notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message(Bytes);

impl Message {
    /// Chat frame, truncated to `max` bytes.
    pub fn chat(payload: &[u8], max: usize) -> Self {
        let end = payload.len().min(max);
        Self(Bytes::copy_from_slice(&payload[..end]))
    }

    /// Join notice listing the roster. Ids that would push the notice past
    /// `max` bytes are elided as ` ...`.
    pub fn joined(id: ClientId, addr: SocketAddr, roster: &[ClientId], max: usize) -> Self {
        const ELIDED: &str = " ...\n";
        let header = format!("A client #{id} ({addr}) connected!\nCurrently connected client(s):");
        let entries: Vec<String> = roster.iter().map(|other| format!(" {other}")).collect();
        let full = header.len() + entries.iter().map(String::len).sum::<usize>() + 1;

        let mut text = header;
        if full <= max {
            text.extend(entries);
            text.push('\n');
        } else {
            for entry in entries {
                if text.len() + entry.len() + ELIDED.len() > max {
                    break;
                }
                text.push_str(&entry);
            }
            text.push_str(ELIDED);
        }
        Self::chat(text.as_bytes(), max)
    }

    pub fn left(id: ClientId, addr: SocketAddr) -> Self {
        Self(Bytes::from(format!("A client #{id} ({addr}) exited.\n")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

pub fn is_exit(payload: &[u8]) -> bool {
    payload.starts_with(EXIT_COMMAND)
}
