//! UDP finder: the sending side of discovery.
//!
//! A finder listens on the discovery port for beacon advertisements and
//! works through its target list in declared order: first advertisement
//! whose name matches the current target wins, the TCP handshake runs, and
//! the loop moves on. Sequential processing keeps the shared UDP socket
//! single-owner; the extra latency is dominated by the beacons' broadcast
//! cadence.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::sync::CancelToken;

use super::{ACK_MAX_LEN, Advertisement, PeerDescriptor};

const RECV_POLL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// One resolved target: its advertised name and the data listener URI its
/// beacon acknowledged with.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTarget {
    pub name: String,
    pub uri: String,
}

pub struct Finder {
    targets: Vec<String>,
    descriptor: PeerDescriptor,
    port: u16,
}

impl Finder {
    pub fn new(targets: Vec<String>, descriptor: PeerDescriptor, port: u16) -> Self {
        Self {
            targets,
            descriptor,
            port,
        }
    }

    /// Resolves every target in declared order. Cancellation aborts the
    /// search; callers treat anything short of the full target list as a
    /// fatal discovery failure.
    pub fn run(&self, cancel: &CancelToken) -> Result<Vec<DiscoveredTarget>> {
        if self.targets.is_empty() {
            return Ok(Vec::new());
        }

        let socket = self.bind_discovery_socket()?;
        let mut found = Vec::with_capacity(self.targets.len());
        let mut buf = [0u8; 2048];

        for target in &self.targets {
            let uri = loop {
                if cancel.fired() {
                    return Err(Error::Cancelled);
                }
                let (len, source) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let Ok(advertisement) = serde_json::from_slice::<Advertisement>(&buf[..len]) else {
                    debug!("discarding malformed discovery packet from {source}");
                    continue;
                };
                if advertisement.name != *target {
                    continue;
                }
                break self.handshake(source.ip(), advertisement.listener_port)?;
            };
            info!("resolved target `{target}` at {uri}");
            found.push(DiscoveredTarget {
                name: target.clone(),
                uri,
            });
        }
        Ok(found)
    }

    /// Discovery port with address reuse, so several finders on one host can
    /// listen for broadcasts at the same time.
    fn bind_discovery_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        let bind_addr = SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, self.port));
        socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::Discovery(format!("failed to bind discovery port {}: {e}", self.port)))?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_POLL))?;
        Ok(socket)
    }

    fn handshake(&self, beacon_ip: IpAddr, listener_port: u16) -> Result<String> {
        let addr = SocketAddr::new(beacon_ip, listener_port);
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| Error::Discovery(format!("failed to connect to beacon at {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT))?;

        let announcement = serde_json::to_vec(&self.descriptor)
            .map_err(|e| Error::Discovery(format!("failed to encode announcement: {e}")))?;
        stream
            .write_all(&announcement)
            .map_err(|e| Error::Discovery(format!("failed to announce to {addr}: {e}")))?;

        // The beacon replies with a single write and closes, so read to EOF
        // bounded by the acknowledgement size limit.
        let mut ack = Vec::new();
        stream
            .take(ACK_MAX_LEN as u64)
            .read_to_end(&mut ack)
            .map_err(|e| Error::Discovery(format!("failed to read acknowledgement from {addr}: {e}")))?;
        if ack.is_empty() {
            return Err(Error::Discovery(format!(
                "beacon at {addr} closed without acknowledging"
            )));
        }
        String::from_utf8(ack)
            .map_err(|_| Error::Discovery(format!("acknowledgement from {addr} is not UTF-8")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::free_udp_port;
    use std::net::TcpListener;
    use std::thread;
    use uuid::Uuid;

    fn test_descriptor() -> PeerDescriptor {
        PeerDescriptor {
            name: "feeder".into(),
            guid: Uuid::new_v4(),
        }
    }

    /// Minimal beacon stand-in: accepts one handshake and acknowledges with
    /// the given URI.
    fn fake_beacon(uri: &'static str) -> (TcpListener, thread::JoinHandle<PeerDescriptor>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let acceptor = listener.try_clone().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = acceptor.accept().unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            let descriptor: PeerDescriptor = serde_json::from_slice(&buf[..n]).unwrap();
            stream.write_all(uri.as_bytes()).unwrap();
            descriptor
        });
        (listener, handle)
    }

    #[test]
    fn test_finder_skips_mismatched_advertisements() {
        let port = free_udp_port();
        let (listener, beacon_thread) = fake_beacon("tcp://127.0.0.1:4100");
        let listener_port = listener.local_addr().unwrap().port();

        let descriptor = test_descriptor();
        let expected = descriptor.clone();
        let finder_thread = thread::spawn(move || {
            Finder::new(vec!["wanted".into()], descriptor, port).run(&CancelToken::new())
        });

        // Broadcast a decoy advertisement first, then the matching one.
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = format!("127.0.0.1:{port}");
        for name in ["decoy", "wanted"] {
            let ad = serde_json::to_vec(&Advertisement {
                name: name.into(),
                listener_port,
            })
            .unwrap();
            sender.send_to(&ad, &target).unwrap();
            thread::sleep(Duration::from_millis(20));
        }

        let targets = finder_thread.join().unwrap().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].uri, "tcp://127.0.0.1:4100");
        assert_eq!(beacon_thread.join().unwrap(), expected);
    }

    #[test]
    fn test_finder_empty_targets() {
        let finder = Finder::new(Vec::new(), test_descriptor(), free_udp_port());
        assert!(finder.run(&CancelToken::new()).unwrap().is_empty());
    }

    #[test]
    fn test_finder_honors_cancellation() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.fire();
        });

        let finder = Finder::new(vec!["absent".into()], test_descriptor(), free_udp_port());
        assert!(matches!(finder.run(&cancel), Err(Error::Cancelled)));
    }
}
