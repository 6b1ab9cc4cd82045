use std::time::Duration;

use crossbeam_channel as channel;
use thiserror::Error;
use tracing::debug;

use crate::message::Message;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("message queue closed")]
    Closed,
}

/// Fixed-capacity FIFO shared by every producer and the single broadcaster.
///
/// Backed by a bounded crossbeam channel: `enqueue` blocks while the queue is
/// full, `dequeue` blocks while it is empty, and the channel re-checks
/// capacity on every wakeup. The queue keeps both channel ends alive, so it
/// never disconnects while it exists.
pub struct MessageQueue {
    tx: channel::Sender<Message>,
    rx: channel::Receiver<Message>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn enqueue(&self, msg: Message) -> Result<(), QueueError> {
        let len = msg.len();
        self.tx.send(msg).map_err(|_| QueueError::Closed)?;
        debug!(bytes = len, depth = self.len(), "Message enqueued");
        Ok(())
    }

    #[allow(dead_code)]
    pub fn dequeue(&self) -> Result<Message, QueueError> {
        let msg = self.rx.recv().map_err(|_| QueueError::Closed)?;
        debug!(bytes = msg.len(), depth = self.len(), "Message dequeued");
        Ok(msg)
    }

    /// Like `dequeue`, but gives up after `timeout` with `Ok(None)`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Result<Option<Message>, QueueError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => {
                debug!(bytes = msg.len(), depth = self.len(), "Message dequeued");
                Ok(Some(msg))
            }
            Err(channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(channel::RecvTimeoutError::Disconnected) => Err(QueueError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn text(msg: &Message) -> String {
        String::from_utf8(msg.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn fifo_single_producer() {
        let q = MessageQueue::new(4);
        q.enqueue("one".into()).unwrap();
        q.enqueue("two".into()).unwrap();
        q.enqueue("three".into()).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(text(&q.dequeue().unwrap()), "one");
        assert_eq!(text(&q.dequeue().unwrap()), "two");
        assert_eq!(text(&q.dequeue().unwrap()), "three");
        assert!(q.is_empty());
    }

    #[test]
    fn per_producer_order_preserved_without_loss() {
        let q = Arc::new(MessageQueue::new(8));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..200 {
                        let payload = format!("{p}:{i}");
                        q.enqueue(Message::chat(payload.as_bytes(), 64)).unwrap();
                    }
                })
            })
            .collect();

        let mut last = [None::<u32>; 4];
        let mut total = 0;
        while total < 800 {
            let msg = q.dequeue().unwrap();
            let s = text(&msg);
            let (p, i) = s.split_once(':').unwrap();
            let (p, i): (usize, u32) = (p.parse().unwrap(), i.parse().unwrap());
            if let Some(prev) = last[p] {
                assert_eq!(i, prev + 1, "producer {p} reordered or duplicated");
            } else {
                assert_eq!(i, 0);
            }
            last[p] = Some(i);
            total += 1;
        }
        for h in producers {
            h.join().unwrap();
        }
        assert!(q.is_empty());
        assert_eq!(last, [Some(199); 4]);
    }

    #[test]
    fn full_queue_blocks_producer_until_dequeue() {
        let q = Arc::new(MessageQueue::new(2));
        q.enqueue("a".into()).unwrap();
        q.enqueue("b".into()).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let q = Arc::clone(&q);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                q.enqueue("c".into()).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "producer passed a full queue");
        assert_eq!(q.len(), q.capacity());

        assert_eq!(text(&q.dequeue().unwrap()), "a");
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(text(&q.dequeue().unwrap()), "b");
        assert_eq!(text(&q.dequeue().unwrap()), "c");
    }

    #[test]
    fn many_blocked_producers_never_exceed_capacity() {
        let q = Arc::new(MessageQueue::new(1));
        q.enqueue("seed".into()).unwrap();
        let producers: Vec<_> = (0..5)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.enqueue("x".into()).unwrap())
            })
            .collect();
        for _ in 0..6 {
            assert!(q.len() <= q.capacity());
            q.dequeue().unwrap();
        }
        for h in producers {
            h.join().unwrap();
        }
        assert!(q.is_empty());
    }

    #[test]
    fn empty_queue_blocks_consumer_until_enqueue() {
        let q = Arc::new(MessageQueue::new(2));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.dequeue().unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        q.enqueue("late".into()).unwrap();
        assert_eq!(text(&consumer.join().unwrap()), "late");
    }

    #[test]
    fn dequeue_timeout_on_empty() {
        let q = MessageQueue::new(2);
        assert_eq!(q.dequeue_timeout(Duration::from_millis(10)).unwrap(), None);
    }
}
