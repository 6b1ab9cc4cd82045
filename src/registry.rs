use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::message::ClientId;

/// One admitted connection. Cloning shares the underlying socket.
#[derive(Clone, Debug)]
pub struct ClientRecord {
    pub id: ClientId,
    pub addr: SocketAddr,
    stream: Arc<TcpStream>,
}

impl ClientRecord {
    pub fn new(id: ClientId, addr: SocketAddr, stream: TcpStream) -> Self {
        Self { id, addr, stream: Arc::new(stream) }
    }

    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut stream = &*self.stream;
        stream.write_all(data)?;
        stream.flush()
    }

    /// Closes both directions; a worker blocked in `read` on a clone of this
    /// socket wakes up with end-of-stream.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// The set of connected clients, guarded by a single lock.
///
/// Broadcast I/O never runs under the lock: callers take a `snapshot` and
/// write after it is released.
pub struct ClientRegistry {
    clients: Mutex<Vec<ClientRecord>>,
    capacity: usize,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    // A panicking holder cannot leave the vector half-updated, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Vec<ClientRecord>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[allow(dead_code)]
    pub fn add(&self, record: ClientRecord) -> bool {
        self.admit(record, |_| ()).is_some()
    }

    /// Inserts `record` and, still holding the lock, hands the resulting
    /// roster to `on_admit`. Returns `None` without calling it when the
    /// registry is full or the id is already present.
    pub fn admit<R>(&self, record: ClientRecord, on_admit: impl FnOnce(&[ClientId]) -> R) -> Option<R> {
        let mut clients = self.lock();
        if clients.len() >= self.capacity || clients.iter().any(|c| c.id == record.id) {
            return None;
        }
        clients.push(record);
        let roster: Vec<ClientId> = clients.iter().map(|c| c.id).collect();
        Some(on_admit(&roster))
    }

    /// Removing an absent id is a no-op.
    pub fn remove(&self, id: ClientId) -> Option<ClientRecord> {
        let mut clients = self.lock();
        let index = clients.iter().position(|c| c.id == id)?;
        Some(clients.remove(index))
    }

    pub fn snapshot(&self) -> Vec<ClientRecord> {
        self.lock().clone()
    }

    #[allow(dead_code)]
    pub fn ids(&self) -> Vec<ClientId> {
        self.lock().iter().map(|c| c.id).collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    /// Shuts down and forgets every connection.
    pub fn dispose(&self) {
        let drained: Vec<ClientRecord> = self.lock().drain(..).collect();
        for record in drained {
            record.shutdown();
        }
    }
}
