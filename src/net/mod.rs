//! Low-level wire plumbing.
//!
//! - [`frame`] - length-framed multipart messages over TCP
//! - [`fanout`] - one-to-many TCP sending
//! - [`interfaces`] - interface enumeration and broadcast address math
//!
//! Data listeners hand out their address as a `tcp://ip:port` URI during the
//! discovery handshake; the helpers here are the single place that format is
//! produced and parsed.

pub mod fanout;
pub mod frame;
pub mod interfaces;

pub use fanout::Fanout;
pub use frame::FrameDecoder;

use std::net::SocketAddr;

use crate::error::{Error, Result};

const URI_SCHEME: &str = "tcp://";

pub fn format_endpoint_uri(addr: SocketAddr) -> String {
    format!("{URI_SCHEME}{addr}")
}

pub fn parse_endpoint_uri(uri: &str) -> Result<SocketAddr> {
    let rest = uri
        .strip_prefix(URI_SCHEME)
        .ok_or_else(|| Error::Transport(format!("endpoint URI `{uri}` is not tcp://")))?;
    rest.parse()
        .map_err(|e| Error::Transport(format!("endpoint URI `{uri}` has an invalid address: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uri_round_trip() {
        let addr: SocketAddr = "192.168.4.17:6120".parse().unwrap();
        let uri = format_endpoint_uri(addr);
        assert_eq!(uri, "tcp://192.168.4.17:6120");
        assert_eq!(parse_endpoint_uri(&uri).unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(parse_endpoint_uri("udp://1.2.3.4:5").is_err());
        assert!(parse_endpoint_uri("tcp://not-an-address").is_err());
    }
}
