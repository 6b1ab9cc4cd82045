use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel as channel;
use tracing::{error, info, warn};

use crate::cli::Serve;
use crate::config::Limits;
use crate::message::{ClientId, Message};
use crate::metrics::{Stats, ThroughputAverager};
use crate::net::broadcaster::run_broadcaster;
use crate::net::worker::{ConnectionWorker, Membership};
use crate::queue::MessageQueue;
use crate::registry::{ClientRecord, ClientRegistry};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const STOP_POLL: Duration = Duration::from_millis(200);

pub fn run_serve(serve: Serve) -> Result<()> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop = stop_flag.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    run_serve_with_shutdown(serve, stop_flag, None)
}

pub(crate) fn run_serve_with_shutdown(
    serve: Serve,
    stop_flag: Arc<AtomicBool>,
    ready: Option<channel::Sender<SocketAddr>>,
) -> Result<()> {
    let limits = Limits::from(&serve);
    limits.validate()?;

    let listener = TcpListener::bind(serve.host)
        .with_context(|| format!("Binding TCP listener at {}", serve.host))?;
    listener
        .set_nonblocking(true)
        .context("Setting TCP listener non-blocking mode")?;
    let local = listener.local_addr().context("Reading listener address")?;
    info!(
        host = %local,
        max_clients = limits.max_clients,
        queue_depth = limits.queue_depth,
        max_message = limits.max_message,
        "Starting chatroom"
    );
    if let Some(tx) = ready {
        let _ = tx.send(local);
    }

    let queue = Arc::new(MessageQueue::new(limits.queue_depth));
    let registry = Arc::new(ClientRegistry::new(limits.max_clients));
    let stats = Arc::new(Stats::default());
    // Broadcaster outlives the workers so a worker blocked on a full queue can finish
    let halt = Arc::new(AtomicBool::new(false));

    let broadcaster = {
        let (queue, registry, stats, halt) =
            (queue.clone(), registry.clone(), stats.clone(), halt.clone());
        thread::Builder::new()
            .name("broadcaster".into())
            .spawn(move || run_broadcaster(queue, registry, stats, halt))
            .context("Spawning broadcaster thread")?
    };

    let reporter = if serve.stats_interval > 0 {
        Some(spawn_reporter(
            Duration::from_secs(serve.stats_interval),
            queue.clone(),
            registry.clone(),
            stats.clone(),
            halt.clone(),
        )?)
    } else {
        None
    };

    let mut acceptor = Acceptor {
        listener,
        limits,
        queue,
        registry: registry.clone(),
        stats: stats.clone(),
        next_id: 1,
        supervisors: Vec::new(),
    };
    info!("Waiting to accept clients...");
    let accepted = acceptor.run(&stop_flag);

    // Shutdown
    info!("Shutting down");
    registry.dispose();
    for supervisor in acceptor.supervisors.drain(..) {
        let _ = supervisor.join();
    }
    halt.store(true, Ordering::Relaxed);
    match broadcaster.join() {
        Ok(Err(e)) => warn!(?e, "Broadcaster error on shutdown"),
        Err(_) => error!("Broadcaster panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(reporter) = reporter {
        let _ = reporter.join();
    }
    if !acceptor.queue.is_empty() {
        warn!(pending = acceptor.queue.len(), "Dropping undelivered messages");
    }
    let totals = stats.snapshot();
    info!(
        accepted = totals.accepted,
        refused = totals.refused,
        departed = totals.departed,
        bytes_in = totals.bytes_in,
        messages_in = totals.messages_in,
        messages_out = totals.messages_out,
        "Final totals"
    );

    accepted
}

struct Acceptor {
    listener: TcpListener,
    limits: Limits,
    queue: Arc<MessageQueue>,
    registry: Arc<ClientRegistry>,
    stats: Arc<Stats>,
    next_id: u64,
    supervisors: Vec<JoinHandle<()>>,
}

impl Acceptor {
    fn run(&mut self, stop_flag: &AtomicBool) -> Result<()> {
        while !stop_flag.load(Ordering::Relaxed) {
            if let Some((stream, addr)) = accept_or_backoff(&self.listener) {
                self.admit(stream, addr)?;
            }
        }
        Ok(())
    }

    /// Only thread-creation failure is an error; anything wrong with the
    /// connection itself drops that connection and keeps accepting.
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        if self.registry.is_full() {
            self.refuse(addr);
            return Ok(());
        }
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(?e, %addr, "Failed to make connection blocking, dropping it");
            return Ok(());
        }
        if let Err(e) = stream.set_write_timeout(self.limits.write_timeout) {
            warn!(?e, %addr, "Failed to set write timeout");
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!(?e, %addr, "Failed to set TCP_NODELAY");
        }
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                warn!(?e, %addr, "Cloning TCP stream (reader) failed, dropping connection");
                return Ok(());
            }
        };

        let id = ClientId(self.next_id);
        self.next_id += 1;
        let queue = &self.queue;
        let max_message = self.limits.max_message;
        let record = ClientRecord::new(id, addr, stream);
        // The join notice is enqueued under the registry lock so its roster
        // matches the insertion that produced it
        match self
            .registry
            .admit(record, |roster| {
                queue.enqueue(Message::joined(id, addr, roster, max_message))
            })
        {
            None => {
                self.refuse(addr);
                return Ok(());
            }
            Some(Err(e)) => warn!(?e, client = %id, "Join notice dropped"),
            Some(Ok(())) => {}
        }
        Stats::bump(&self.stats.accepted);
        info!(client = %id, %addr, connected = self.registry.count(), "Accepted connection");

        let membership = Membership::new(
            id,
            addr,
            self.registry.clone(),
            self.queue.clone(),
            self.stats.clone(),
        );
        let worker = ConnectionWorker::new(reader, self.limits.max_message, membership);
        let handle = thread::Builder::new()
            .name(format!("client-{id}"))
            .spawn(move || worker.run())
            .with_context(|| format!("Spawning worker for client {id}"))?;

        // Supervisor makes worker termination observable, panics included
        let supervisor = thread::Builder::new()
            .name(format!("client-{id}-supervisor"))
            .spawn(move || match handle.join() {
                Ok(exit) => info!(client = %id, %addr, ?exit, "Closed connection"),
                Err(_) => error!(client = %id, %addr, "Connection worker panicked"),
            })
            .with_context(|| format!("Spawning supervisor for client {id}"))?;
        self.supervisors.retain(|h| !h.is_finished());
        self.supervisors.push(supervisor);
        Ok(())
    }

    fn refuse(&self, addr: SocketAddr) {
        Stats::bump(&self.stats.refused);
        warn!(
            %addr,
            max_clients = self.registry.capacity(),
            "Max client number reached, refusing connection"
        );
    }
}

/// One accept attempt. Sleeps `ACCEPT_BACKOFF` and yields `None` when no
/// connection is pending or accept failed, so a persistent error such as
/// descriptor exhaustion cannot spin the loop.
fn accept_or_backoff(listener: &TcpListener) -> Option<(TcpStream, SocketAddr)> {
    match listener.accept() {
        Ok(conn) => Some(conn),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
            thread::sleep(ACCEPT_BACKOFF);
            None
        }
        Err(e) => {
            warn!(?e, "Accept failed");
            thread::sleep(ACCEPT_BACKOFF);
            None
        }
    }
}

fn spawn_reporter(
    interval: Duration,
    queue: Arc<MessageQueue>,
    registry: Arc<ClientRegistry>,
    stats: Arc<Stats>,
    halt: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("stats".into())
        .spawn(move || {
            let ticker = channel::tick(interval);
            let mut avg_in = ThroughputAverager::new(5.0);
            let mut avg_out = ThroughputAverager::new(5.0);
            let mut last = stats.snapshot();
            let mut last_time = Instant::now();
            while !halt.load(Ordering::Relaxed) {
                let now = match ticker.recv_timeout(STOP_POLL) {
                    Ok(now) => now,
                    Err(channel::RecvTimeoutError::Timeout) => continue,
                    Err(channel::RecvTimeoutError::Disconnected) => break,
                };
                let dt = now.duration_since(last_time).as_secs_f64();
                last_time = now;
                let current = stats.snapshot();
                let inbound = avg_in.update(current.messages_in - last.messages_in, dt) as u64;
                let outbound = avg_out.update(current.deliveries - last.deliveries, dt) as u64;
                last = current;
                info!(
                    connected = registry.count(),
                    queued = queue.len(),
                    queue_capacity = queue.capacity(),
                    inbound_msgs_per_sec = inbound,
                    outbound_writes_per_sec = outbound,
                    write_failures = current.write_failures,
                    "Throughput"
                );
            }
        })
        .context("Spawning stats thread")
}

#[cfg(test)]
mod itests {
    use super::*;
    use std::io::{Read, Write};

    struct Peer {
        stream: TcpStream,
        pending: String,
    }

    impl Peer {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            Self { stream, pending: String::new() }
        }

        fn send(&mut self, data: &[u8]) {
            self.stream.write_all(data).unwrap();
        }

        /// Consumes and returns everything up to and including `needle`.
        fn expect(&mut self, needle: &str) -> String {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(pos) = self.pending.find(needle) {
                    let end = pos + needle.len();
                    return self.pending.drain(..end).collect();
                }
                let n = self.stream.read(&mut buf).expect("read timed out");
                assert!(n > 0, "closed before {needle:?}, got {:?}", self.pending);
                self.pending.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        }

        fn expect_closed(&mut self) {
            let mut buf = [0u8; 1024];
            loop {
                match self.stream.read(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => self.pending.push_str(&String::from_utf8_lossy(&buf[..n])),
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        panic!("connection still open")
                    }
                    Err(_) => return,
                }
            }
        }
    }

    fn spawn_server(max_clients: usize) -> (SocketAddr, Arc<AtomicBool>, JoinHandle<Result<()>>) {
        let serve = Serve {
            host: "127.0.0.1:0".parse().unwrap(),
            max_clients,
            queue_depth: 16,
            max_message: 1024,
            write_timeout_ms: 1_000,
            stats_interval: 0,
        };
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::bounded(1);
        let stop_clone = stop.clone();
        let handle = thread::spawn(move || run_serve_with_shutdown(serve, stop_clone, Some(tx)));
        let addr = rx.recv_timeout(Duration::from_secs(5)).expect("server ready");
        (addr, stop, handle)
    }

    fn shutdown(stop: Arc<AtomicBool>, handle: JoinHandle<Result<()>>) {
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn join_chat_and_exit() {
        let (addr, stop, handle) = spawn_server(8);

        let mut a = Peer::connect(addr);
        a.expect("client(s): 1\n");
        let mut b = Peer::connect(addr);
        a.expect("client(s): 1 2\n");
        b.expect("client(s): 1 2\n");

        // Third client joins two registered ones
        let mut c = Peer::connect(addr);
        for peer in [&mut a, &mut b, &mut c] {
            let notice = peer.expect("client(s): 1 2 3\n");
            assert!(notice.contains("A client #3 ("));
            assert!(notice.contains("connected!"));
        }

        // Chat relay, sender included
        a.send(b"alice: hello\n");
        for peer in [&mut a, &mut b, &mut c] {
            peer.expect("alice: hello\n");
        }

        // Graceful exit
        b.send(b"exit\n");
        b.expect_closed();
        for peer in [&mut a, &mut c] {
            let notice = peer.expect("exited.\n");
            assert!(notice.contains("A client #2 ("));
        }

        // Roster no longer lists the departed client
        let mut d = Peer::connect(addr);
        a.expect("client(s): 1 3 4\n");
        d.expect("client(s): 1 3 4\n");

        shutdown(stop, handle);
        a.expect_closed();
    }

    #[test]
    fn refuses_when_full() {
        let (addr, stop, handle) = spawn_server(1);

        let mut a = Peer::connect(addr);
        a.expect("client(s): 1\n");

        let mut b = Peer::connect(addr);
        b.expect_closed();

        a.send(b"ping\n");
        let seen = a.expect("ping\n");
        assert!(!seen.contains("connected"), "refused client was announced: {seen:?}");

        shutdown(stop, handle);
    }

    #[test]
    fn disconnect_frees_a_slot() {
        let (addr, stop, handle) = spawn_server(1);

        let mut a = Peer::connect(addr);
        a.expect("client(s): 1\n");
        drop(a);

        // The slot frees once the worker has departed; retry until admitted
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut b = loop {
            let mut b = Peer::connect(addr);
            let mut buf = [0u8; 256];
            match b.stream.read(&mut buf) {
                Ok(n) if n > 0 => {
                    b.pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                    break b;
                }
                _ => {
                    assert!(Instant::now() < deadline, "slot never freed");
                    thread::sleep(Duration::from_millis(50));
                }
            }
        };
        b.expect("client(s): 2\n");

        shutdown(stop, handle);
    }

    #[test]
    fn idle_accept_backs_off() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let started = Instant::now();
        assert!(accept_or_backoff(&listener).is_none());
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while accept_or_backoff(&listener).is_none() {
            assert!(Instant::now() < deadline, "pending connection never accepted");
        }
    }

    #[test]
    fn invalid_limits_rejected_before_bind() {
        let serve = Serve {
            host: "127.0.0.1:0".parse().unwrap(),
            max_clients: 0,
            queue_depth: 16,
            max_message: 1024,
            write_timeout_ms: 0,
            stats_interval: 0,
        };
        let err = run_serve_with_shutdown(serve, Arc::new(AtomicBool::new(false)), None).unwrap_err();
        assert!(err.downcast_ref::<crate::config::ConfigError>().is_some());
    }
}
