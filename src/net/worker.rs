use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::message::{is_exit, ClientId, Message};
use crate::metrics::Stats;
use crate::queue::MessageQueue;
use crate::registry::ClientRegistry;

/// Why a worker stopped reading.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    PeerClosed,
    ExitCommand,
    ReadError,
    QueueClosed,
}

/// Ties a registry entry to the lifetime of its worker.
///
/// Departure runs at most once, either explicitly or on drop (including
/// unwinding out of a panicking worker). Only the caller that actually
/// removed the record closes the socket and announces the departure.
pub struct Membership {
    id: ClientId,
    addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    queue: Arc<MessageQueue>,
    stats: Arc<Stats>,
    departed: bool,
}

impl Membership {
    pub fn new(
        id: ClientId,
        addr: SocketAddr,
        registry: Arc<ClientRegistry>,
        queue: Arc<MessageQueue>,
        stats: Arc<Stats>,
    ) -> Self {
        Self { id, addr, registry, queue, stats, departed: false }
    }

    pub fn depart(&mut self) {
        if std::mem::replace(&mut self.departed, true) {
            return;
        }
        let Some(record) = self.registry.remove(self.id) else {
            // already removed, e.g. by shutdown
            return;
        };
        record.shutdown();
        Stats::bump(&self.stats.departed);
        info!(client = %self.id, addr = %self.addr, remaining = self.registry.count(), "Client left");
        if let Err(e) = self.queue.enqueue(Message::left(self.id, self.addr)) {
            warn!(?e, client = %self.id, "Leave notice dropped");
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.depart();
    }
}

/// Reads one client's frames into the shared queue until the client goes away.
pub struct ConnectionWorker {
    id: ClientId,
    stream: TcpStream,
    queue: Arc<MessageQueue>,
    stats: Arc<Stats>,
    max_message: usize,
    membership: Membership,
}

impl ConnectionWorker {
    pub fn new(
        stream: TcpStream,
        max_message: usize,
        membership: Membership,
    ) -> Self {
        Self {
            id: membership.id,
            queue: Arc::clone(&membership.queue),
            stats: Arc::clone(&membership.stats),
            stream,
            max_message,
            membership,
        }
    }

    pub fn run(mut self) -> WorkerExit {
        let mut buffer = vec![0u8; self.max_message];
        let exit = loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => break WorkerExit::PeerClosed,
                Ok(n) => {
                    let payload = &buffer[..n];
                    if is_exit(payload) {
                        break WorkerExit::ExitCommand;
                    }
                    self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    Stats::bump(&self.stats.messages_in);
                    debug!(client = %self.id, bytes = n, "Frame received");
                    if let Err(e) = self.queue.enqueue(Message::chat(payload, self.max_message)) {
                        warn!(?e, client = %self.id, "Dropping frame, queue closed");
                        break WorkerExit::QueueClosed;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(?e, client = %self.id, "TCP read error");
                    break WorkerExit::ReadError;
                }
            }
        };
        debug!(client = %self.id, ?exit, "Worker exiting");
        self.membership.depart();
        exit
    }
}
