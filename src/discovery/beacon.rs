//! UDP beacon: the receiving side of discovery.
//!
//! A beacon advertises its announcement acceptor on every configured
//! broadcast endpoint until exactly the required number of distinct finders
//! has completed the TCP handshake, then returns their self-descriptions.
//! Broadcasting runs on a background thread; handshakes are accepted on the
//! calling thread so the caller's cancellation is honored between polls.

use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sync::CancelToken;

use super::{
    ACK_MAX_LEN, Advertisement, BROADCAST_INTERVAL, BroadcastEndpoint, DiscoveryConfig,
    PeerDescriptor,
};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Beacon {
    name: String,
    required_finders: usize,
    ack: String,
    config: DiscoveryConfig,
}

impl Beacon {
    /// `ack` is echoed verbatim to every finder that completes the
    /// handshake; for an input step it carries the data listener URI.
    pub fn new(
        name: String,
        required_finders: usize,
        ack: String,
        config: DiscoveryConfig,
    ) -> Self {
        debug_assert!(ack.len() <= ACK_MAX_LEN);
        Self {
            name,
            required_finders,
            ack,
            config,
        }
    }

    /// Advertises until `required_finders` distinct finders have handshaken,
    /// cancellation fires, or broadcasting fails. All sockets are released
    /// before returning.
    pub fn run(&self, cancel: &CancelToken) -> Result<Vec<PeerDescriptor>> {
        if self.required_finders == 0 {
            return Ok(Vec::new());
        }

        // The acceptor must exist before the first advertisement goes out,
        // or a fast finder could race the bind.
        let acceptor = TcpListener::bind("0.0.0.0:0")?;
        acceptor.set_nonblocking(true)?;
        let port = acceptor.local_addr()?.port();
        info!(
            "beacon for `{}` accepting announcements on port {port}",
            self.name
        );

        let advertisement = serde_json::to_vec(&Advertisement {
            name: self.name.clone(),
            listener_port: port,
        })
        .map_err(|e| Error::Discovery(format!("failed to encode advertisement: {e}")))?;

        let broadcaster = Broadcaster::start(&self.config.endpoints, advertisement)?;
        let result = self.collect(&acceptor, cancel, broadcaster.errors());
        broadcaster.stop();
        result
    }

    fn collect(
        &self,
        acceptor: &TcpListener,
        cancel: &CancelToken,
        errors: &Receiver<Error>,
    ) -> Result<Vec<PeerDescriptor>> {
        let mut peers = Vec::with_capacity(self.required_finders);
        let mut seen: HashSet<SocketAddr> = HashSet::new();

        while peers.len() < self.required_finders {
            if cancel.fired() {
                return Err(Error::Cancelled);
            }
            if let Ok(error) = errors.try_recv() {
                return Err(error);
            }
            match acceptor.accept() {
                Ok((stream, remote)) => {
                    if !seen.insert(remote) {
                        return Err(Error::Discovery(format!(
                            "finder endpoint {remote} announced itself twice"
                        )));
                    }
                    let peer = self.handshake(stream, remote)?;
                    info!(
                        "registered source `{}` from {remote} ({}/{})",
                        peer.name,
                        peers.len() + 1,
                        self.required_finders
                    );
                    peers.push(peer);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(peers)
    }

    fn handshake(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<PeerDescriptor> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT))?;
        stream.set_nodelay(true)?;

        let mut buf = vec![0u8; ACK_MAX_LEN];
        let mut filled = 0;
        let descriptor = loop {
            if filled == buf.len() {
                return Err(Error::Discovery(format!(
                    "announcement from {remote} exceeds {ACK_MAX_LEN} bytes"
                )));
            }
            let n = stream
                .read(&mut buf[filled..])
                .map_err(|e| Error::Discovery(format!("failed to read announcement from {remote}: {e}")))?;
            if n == 0 {
                return Err(Error::Discovery(format!(
                    "finder {remote} closed before announcing itself"
                )));
            }
            filled += n;
            if let Ok(descriptor) = serde_json::from_slice::<PeerDescriptor>(&buf[..filled]) {
                break descriptor;
            }
        };

        stream
            .write_all(self.ack.as_bytes())
            .map_err(|e| Error::Discovery(format!("failed to acknowledge {remote}: {e}")))?;
        Ok(descriptor)
    }
}

/// Background advertisement sender: one UDP socket per endpoint, one send
/// per endpoint per interval.
struct Broadcaster {
    stop: Arc<AtomicBool>,
    errors: Receiver<Error>,
    handle: Option<JoinHandle<()>>,
}

impl Broadcaster {
    fn start(endpoints: &[BroadcastEndpoint], advertisement: Vec<u8>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Discovery("no broadcast endpoint configured".into()));
        }

        let mut sockets = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_broadcast(true)?;
            socket.bind(&SocketAddr::from(SocketAddrV4::new(endpoint.local, 0)).into())?;
            let socket: UdpSocket = socket.into();
            sockets.push((socket, SocketAddr::from(endpoint.target)));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (err_tx, err_rx) = bounded(1);
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("beacon-broadcast".into())
            .spawn(move || {
                debug!("beacon broadcast thread started");
                while !stop_flag.load(Ordering::SeqCst) {
                    for (socket, target) in &sockets {
                        if let Err(e) = socket.send_to(&advertisement, target) {
                            let _ = err_tx
                                .send(Error::Discovery(format!("broadcast to {target} failed: {e}")));
                            return;
                        }
                    }
                    thread::sleep(BROADCAST_INTERVAL);
                }
                debug!("beacon broadcast thread stopped");
            })?;

        Ok(Self {
            stop,
            errors: err_rx,
            handle: Some(handle),
        })
    }

    fn errors(&self) -> &Receiver<Error> {
        &self.errors
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("beacon broadcast thread panicked");
            }
        }
    }
}
