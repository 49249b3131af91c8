//! One-to-many TCP sending.
//!
//! A [`Fanout`] owns one connection per downstream target and writes every
//! message to all of them. It is created on the driver thread during output
//! awaken, then handed to the background sender thread which is its sole
//! user from that point on.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::net::frame::write_message;
use crate::net::parse_endpoint_uri;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Fanout {
    streams: Vec<(SocketAddr, TcpStream)>,
}

impl Fanout {
    /// Connects to every `tcp://ip:port` URI. Any single connection failure
    /// fails the whole fan-out.
    pub fn connect(uris: &[String]) -> Result<Self> {
        let mut streams = Vec::with_capacity(uris.len());
        for uri in uris {
            let addr = parse_endpoint_uri(uri)?;
            let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
                .map_err(|e| Error::Transport(format!("failed to connect to {uri}: {e}")))?;
            stream.set_nodelay(true)?;
            info!("connected to target {uri}");
            streams.push((addr, stream));
        }
        Ok(Self { streams })
    }

    pub fn target_count(&self) -> usize {
        self.streams.len()
    }

    /// Writes one framed message to every connected target.
    pub fn send_to_all(&mut self, frames: &[&[u8]]) -> Result<()> {
        for (addr, stream) in &mut self.streams {
            write_message(stream, frames)
                .map_err(|e| Error::Transport(format!("failed to send to {addr}: {e}")))?;
        }
        Ok(())
    }

    /// Best-effort shutdown of every connection.
    pub fn shutdown(&mut self) {
        for (addr, stream) in &self.streams {
            if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
                warn!("failed to shut down connection to {addr}: {e}");
            }
        }
        self.streams.clear();
    }
}
