//! Input step: upstream discovery, connection harvesting, and the
//! all-sources-ready receive gate.
//!
//! Awaken binds the data listener on a random port of the inbound
//! interface, starts the background receiver, then runs a beacon until
//! every expected upstream peer has handshaken. The receiver is already
//! accepting while the beacon runs, so a peer that finishes its handshake
//! early can connect and send without losing messages — anything arriving
//! before the source set is known is staged inside the fan-in buffer.
//!
//! [`InputStep::receive`] hands the driver exactly one message per source,
//! in the fixed disambiguated-name order, blocking until every source has
//! one queued. The ready-flag map is a driver-thread cache over the queues'
//! depth counters; it can lag a just-filled queue by one poll round, which
//! the 1 ms poll cadence absorbs.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{Beacon, DiscoveryConfig};
use crate::error::{Error, Result};
use crate::net::format_endpoint_uri;
use crate::net::frame::{FrameDecoder, GUID_FRAME_LEN};
use crate::pipeline::fanin::FanInBuffer;
use crate::pipeline::step::Step;
use crate::sync::{CancelToken, DoneReceiver, done_pair};

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const RECEIVER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
const READ_BUF_LEN: usize = 64 * 1024;

pub struct InputStep {
    pipeline_name: String,
    expected_sources: usize,
    inbound_ip: Ipv4Addr,
    discovery: DiscoveryConfig,
    cancel: CancelToken,
    fanin: Arc<FanInBuffer>,
    fault: Arc<Mutex<Option<String>>>,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    done: Option<DoneReceiver>,
    /// `(guid, display name)` in fixed order, set once at awaken.
    sources: Vec<(Uuid, String)>,
    ready: HashMap<Uuid, bool>,
    ended: bool,
}

impl InputStep {
    pub fn new(
        pipeline_name: String,
        expected_sources: usize,
        inbound_ip: Ipv4Addr,
        discovery: DiscoveryConfig,
    ) -> Self {
        debug_assert!(expected_sources > 0);
        Self {
            pipeline_name,
            expected_sources,
            inbound_ip,
            discovery,
            cancel: CancelToken::new(),
            fanin: Arc::new(FanInBuffer::new()),
            fault: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            receiver: None,
            done: None,
            sources: Vec::new(),
            ready: HashMap::new(),
            ended: false,
        }
    }

    /// One message per source in fixed order. Blocks until every source has
    /// a message queued, honoring cancellation and surfacing receiver
    /// faults while blocked.
    pub fn receive(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        if self.sources.is_empty() {
            return Err(Error::Transport("input step is not awakened".into()));
        }
        loop {
            if self.cancel.fired() {
                return Err(Error::Cancelled);
            }
            if let Some(message) = self
                .fault
                .lock()
                .expect("fault slot lock poisoned")
                .clone()
            {
                return Err(Error::Transport(message));
            }

            let mut all_ready = true;
            for (guid, _) in &self.sources {
                let flag = self.ready.get_mut(guid).expect("ready flag exists");
                if !*flag {
                    if self.fanin.depth(guid) > 0 {
                        *flag = true;
                    } else {
                        all_ready = false;
                    }
                }
            }

            if all_ready {
                let mut batch = Vec::with_capacity(self.sources.len());
                for (guid, display_name) in &self.sources {
                    let payload = self.fanin.try_pop(guid).ok_or_else(|| {
                        Error::Transport("fan-in queue drained unexpectedly".into())
                    })?;
                    *self.ready.get_mut(guid).expect("ready flag exists") =
                        self.fanin.depth(guid) > 0;
                    batch.push((display_name.clone(), payload));
                }
                return Ok(batch);
            }

            thread::sleep(IDLE_SLEEP);
        }
    }

    fn stop_receiver(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let finished = match self.done.take() {
            Some(done) => done.wait(RECEIVER_JOIN_TIMEOUT),
            None => true,
        };
        match self.receiver.take() {
            Some(handle) if finished => {
                if handle.join().is_err() {
                    warn!("input receiver panicked");
                }
            }
            Some(_) => {
                // The listener is disposed inside the receiver's own
                // terminating branch, so detaching is safe.
                warn!("input receiver did not stop within {RECEIVER_JOIN_TIMEOUT:?}; detaching");
            }
            None => {}
        }
    }
}

impl Step for InputStep {
    fn label(&self) -> &str {
        "input"
    }

    fn set_cancel(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    fn awaken(&mut self) -> Result<()> {
        let listener = TcpListener::bind(SocketAddr::from(SocketAddrV4::new(self.inbound_ip, 0)))?;
        listener.set_nonblocking(true)?;
        let data_addr = listener.local_addr()?;
        info!(
            "data listener for `{}` bound on {data_addr}",
            self.pipeline_name
        );

        // The receiver starts before discovery completes so peers that
        // finish their handshake early are accepted right away.
        let worker = ReceiverWorker {
            listener,
            fanin: self.fanin.clone(),
            fault: self.fault.clone(),
            stop: self.stop.clone(),
        };
        let (done_tx, done_rx) = done_pair();
        self.receiver = Some(
            thread::Builder::new()
                .name("input-receive".into())
                .spawn(move || {
                    let _done = done_tx;
                    worker.run();
                })?,
        );
        self.done = Some(done_rx);

        let beacon = Beacon::new(
            self.pipeline_name.clone(),
            self.expected_sources,
            format_endpoint_uri(data_addr),
            self.discovery.clone(),
        );
        let peers = match beacon.run(&self.cancel) {
            Ok(peers) => peers,
            Err(e) => {
                self.stop_receiver();
                return Err(e);
            }
        };

        let sources: Vec<(Uuid, String)> =
            peers.into_iter().map(|peer| (peer.guid, peer.name)).collect();
        self.fanin.install(&sources);
        self.sources = self.fanin.sources();
        self.ready = self.sources.iter().map(|(guid, _)| (*guid, false)).collect();
        info!(
            "input step for `{}` ready with {} source(s)",
            self.pipeline_name,
            self.sources.len()
        );
        Ok(())
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.stop_receiver();
    }
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
    open: bool,
}

/// Owns the data listener and every accepted connection for the step's
/// lifetime; both are disposed when this worker's run loop returns.
struct ReceiverWorker {
    listener: TcpListener,
    fanin: Arc<FanInBuffer>,
    fault: Arc<Mutex<Option<String>>>,
    stop: Arc<AtomicBool>,
}

impl ReceiverWorker {
    fn run(self) {
        info!("input receive thread started");

        let mut connections: Vec<Connection> = Vec::new();
        let mut buf = [0u8; READ_BUF_LEN];

        'outer: while !self.stop.load(Ordering::SeqCst) {
            let mut idle = true;

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        self.record_fault(format!(
                            "failed to configure data connection from {peer}: {e}"
                        ));
                        break;
                    }
                    debug!("accepted data connection from {peer}");
                    connections.push(Connection {
                        stream,
                        peer,
                        decoder: FrameDecoder::new(),
                        open: true,
                    });
                    idle = false;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.record_fault(format!("data listener failed: {e}"));
                    break;
                }
            }

            for connection in &mut connections {
                match Self::drain(connection, &mut buf, &self.fanin) {
                    Ok(read_any) => idle &= !read_any,
                    Err(e) => {
                        self.record_fault(e.to_string());
                        break 'outer;
                    }
                }
            }
            connections.retain(|connection| connection.open);

            if idle {
                thread::sleep(IDLE_SLEEP);
            }
        }

        info!("input receive thread shutting down");
    }

    /// Reads whatever the connection has buffered and deposits every
    /// complete message. A malformed message is a fatal protocol error; a
    /// peer disconnect just closes that connection.
    fn drain(
        connection: &mut Connection,
        buf: &mut [u8],
        fanin: &FanInBuffer,
    ) -> Result<bool> {
        let mut read_any = false;
        loop {
            match connection.stream.read(buf) {
                Ok(0) => {
                    debug!("data connection from {} closed", connection.peer);
                    connection.open = false;
                    break;
                }
                Ok(n) => {
                    read_any = true;
                    connection.decoder.extend(&buf[..n]);
                    while let Some(frames) = connection.decoder.next_message()? {
                        Self::dispatch(frames, connection.peer, fanin)?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("read error on data connection from {}: {e}", connection.peer);
                    connection.open = false;
                    break;
                }
            }
        }
        Ok(read_any)
    }

    fn dispatch(mut frames: Vec<Vec<u8>>, peer: SocketAddr, fanin: &FanInBuffer) -> Result<()> {
        if frames.len() != 2 {
            return Err(Error::Transport(format!(
                "message from {peer} has {} frame(s), expected 2",
                frames.len()
            )));
        }
        let payload = frames.pop().expect("two frames");
        let guid: [u8; GUID_FRAME_LEN] = frames[0].as_slice().try_into().map_err(|_| {
            Error::Transport(format!(
                "message from {peer} has a {}-byte id frame, expected {GUID_FRAME_LEN}",
                frames[0].len()
            ))
        })?;
        fanin.deposit(Uuid::from_bytes(guid), payload);
        Ok(())
    }

    fn record_fault(&self, message: String) {
        warn!("input receiver fault: {message}");
        let mut fault = self.fault.lock().expect("fault slot lock poisoned");
        if fault.is_none() {
            *fault = Some(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Finder, PeerDescriptor, free_udp_port};
    use crate::net::frame::write_message;
    use crate::net::parse_endpoint_uri;

    #[test]
    fn test_input_step_end_to_end() {
        let port = free_udp_port();
        let mut input = InputStep::new(
            "sink".into(),
            1,
            Ipv4Addr::LOCALHOST,
            DiscoveryConfig::loopback(port),
        );
        input.set_cancel(CancelToken::new());

        let source_guid = Uuid::new_v4();
        let upstream = thread::spawn(move || {
            let finder = Finder::new(
                vec!["sink".into()],
                PeerDescriptor {
                    name: "feeder".into(),
                    guid: source_guid,
                },
                port,
            );
            let targets = finder.run(&CancelToken::new()).unwrap();
            let addr = parse_endpoint_uri(&targets[0].uri).unwrap();
            let mut stream = TcpStream::connect(addr).unwrap();
            write_message(&mut stream, &[source_guid.as_bytes(), b"one"]).unwrap();
            write_message(&mut stream, &[source_guid.as_bytes(), b"two"]).unwrap();
        });

        input.awaken().unwrap();

        let first = input.receive().unwrap();
        assert_eq!(first, vec![("feeder".to_string(), b"one".to_vec())]);
        let second = input.receive().unwrap();
        assert_eq!(second[0].1, b"two");

        upstream.join().unwrap();

        // With no message pending, receive blocks until cancellation fires.
        let cancel = CancelToken::new();
        input.set_cancel(cancel.clone());
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.fire();
        });
        assert!(matches!(input.receive(), Err(Error::Cancelled)));

        input.end();
        input.end();
    }

    /// Two upstream peers with the same advertised name: the step gates on
    /// one message from each and presents disambiguated keys in handshake
    /// order.
    #[test]
    fn test_two_sources_with_duplicate_names() {
        let port = free_udp_port();
        let mut input = InputStep::new(
            "join".into(),
            2,
            Ipv4Addr::LOCALHOST,
            DiscoveryConfig::loopback(port),
        );
        input.set_cancel(CancelToken::new());

        // The rounds run sequentially so each finder has the discovery port
        // to itself; unicast test packets would otherwise be load-balanced
        // between reuse-port sockets.
        let feeders = thread::spawn(move || {
            let mut streams = Vec::new();
            for n in 0u8..2 {
                let guid = Uuid::from_bytes([n + 1; 16]);
                let finder = Finder::new(
                    vec!["join".into()],
                    PeerDescriptor {
                        name: "feed".into(),
                        guid,
                    },
                    port,
                );
                let targets = finder.run(&CancelToken::new()).unwrap();
                let addr = parse_endpoint_uri(&targets[0].uri).unwrap();
                let mut stream = TcpStream::connect(addr).unwrap();
                write_message(&mut stream, &[guid.as_bytes(), &[n]]).unwrap();
                streams.push(stream);
            }
            streams
        });

        input.awaken().unwrap();
        let batch = input.receive().unwrap();
        assert_eq!(
            batch,
            vec![
                ("feed".to_string(), vec![0u8]),
                ("feed (1)".to_string(), vec![1u8]),
            ]
        );

        drop(feeders.join().unwrap());
        input.end();
    }

    #[test]
    fn test_awaken_fails_cleanly_when_discovery_is_cancelled() {
        let port = free_udp_port();
        let mut input = InputStep::new(
            "nobody-finds-me".into(),
            1,
            Ipv4Addr::LOCALHOST,
            DiscoveryConfig::loopback(port),
        );
        let cancel = CancelToken::new();
        input.set_cancel(cancel.clone());

        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.fire();
        });

        assert!(matches!(input.awaken(), Err(Error::Cancelled)));
        // The background receiver was stopped by the failed awaken.
        input.end();
    }
}
