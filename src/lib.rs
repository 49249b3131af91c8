//! Flowline: distributed script pipelines over LAN discovery.
//!
//! Each pipeline is an independent process running an ordered chain of user
//! Python scripts. Pipelines discover each other on the local network by
//! advertised name (UDP broadcast answered by a TCP handshake) and exchange
//! length-framed binary messages over persistent TCP connections. A
//! pipeline with upstream peers gates every iteration on one message from
//! each of them; a pipeline with downstream peers fans its result out to
//! all of them.

pub mod config;
pub mod discovery;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod script;
pub mod sync;

pub use config::{Environment, PipelineConfig};
pub use error::{Error, Result};
pub use pipeline::{ExitStatus, PipelineDriver};
pub use sync::CancelToken;
