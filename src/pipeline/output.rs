//! Output step: target discovery and fan-out sending.
//!
//! Awaken resolves every target by name through a finder, connects the
//! fan-out socket set, and starts the background sender. The sender is the
//! sole owner of the connections from then on; the driver only touches the
//! send queue. [`OutputStep::send`] never blocks — payloads go onto an
//! unbounded queue in call order, and a fault captured by the sender is
//! surfaced on the next call.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{Finder, PeerDescriptor};
use crate::error::{Error, Result};
use crate::net::Fanout;
use crate::pipeline::step::Step;
use crate::sync::{CancelToken, DoneReceiver, done_pair};

const SENDER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_POLL: Duration = Duration::from_millis(50);

pub struct OutputStep {
    pipeline_name: String,
    targets: Vec<String>,
    discovery_port: u16,
    guid: Uuid,
    cancel: CancelToken,
    queue: Option<Sender<Vec<u8>>>,
    fault: Arc<Mutex<Option<String>>>,
    sender: Option<JoinHandle<()>>,
    done: Option<DoneReceiver>,
    ended: bool,
}

impl OutputStep {
    pub fn new(pipeline_name: String, targets: Vec<String>, discovery_port: u16) -> Self {
        debug_assert!(!targets.is_empty());
        Self {
            pipeline_name,
            targets,
            discovery_port,
            // Minted per step instance; identifies this sender on the wire
            // even when pipeline names collide.
            guid: Uuid::new_v4(),
            cancel: CancelToken::new(),
            queue: None,
            fault: Arc::new(Mutex::new(None)),
            sender: None,
            done: None,
            ended: false,
        }
    }

    pub fn connection_guid(&self) -> Uuid {
        self.guid
    }

    /// Enqueues a payload for every target and returns immediately. A fault
    /// captured by the background sender fails this and every following
    /// call, even a null one; otherwise a null payload is dropped.
    pub fn send(&self, payload: Option<Vec<u8>>) -> Result<()> {
        if let Some(message) = self
            .fault
            .lock()
            .expect("fault slot lock poisoned")
            .clone()
        {
            return Err(Error::Transport(message));
        }
        let Some(payload) = payload else {
            return Ok(());
        };
        let Some(queue) = &self.queue else {
            return Err(Error::Transport("output step is not awakened".into()));
        };
        queue
            .send(payload)
            .map_err(|_| Error::Transport("send queue is closed".into()))
    }
}

impl Step for OutputStep {
    fn label(&self) -> &str {
        "output"
    }

    fn set_cancel(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    fn awaken(&mut self) -> Result<()> {
        let finder = Finder::new(
            self.targets.clone(),
            PeerDescriptor {
                name: self.pipeline_name.clone(),
                guid: self.guid,
            },
            self.discovery_port,
        );
        let found = finder.run(&self.cancel)?;
        if found.len() != self.targets.len() {
            return Err(Error::Discovery(format!(
                "resolved {} of {} target(s)",
                found.len(),
                self.targets.len()
            )));
        }

        let uris: Vec<String> = found.into_iter().map(|target| target.uri).collect();
        let fanout = Fanout::connect(&uris)?;

        let (queue_tx, queue_rx) = unbounded();
        let (done_tx, done_rx) = done_pair();
        let worker = SenderWorker {
            fanout,
            queue: queue_rx,
            guid: self.guid,
            fault: self.fault.clone(),
            cancel: self.cancel.clone(),
        };
        self.sender = Some(
            thread::Builder::new()
                .name("output-send".into())
                .spawn(move || {
                    let _done = done_tx;
                    worker.run();
                })?,
        );
        self.done = Some(done_rx);
        self.queue = Some(queue_tx);
        info!(
            "output step for `{}` connected to {} target(s)",
            self.pipeline_name,
            self.targets.len()
        );
        Ok(())
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        // Closing the writer end lets the sender drain and stop.
        self.queue.take();

        let finished = match self.done.take() {
            Some(done) => done.wait(SENDER_JOIN_TIMEOUT),
            None => true,
        };
        match self.sender.take() {
            Some(handle) if finished => {
                if handle.join().is_err() {
                    warn!("output sender panicked");
                }
            }
            Some(_) => {
                warn!("output sender did not stop within {SENDER_JOIN_TIMEOUT:?}; detaching");
            }
            None => {}
        }

        // A fault nothing got to observe via send() is only worth a log
        // line this late.
        if let Some(message) = self
            .fault
            .lock()
            .expect("fault slot lock poisoned")
            .take()
        {
            warn!("output sender fault observed at end: {message}");
        }
    }
}

/// Owns the fan-out connections; they are disposed in this worker's
/// terminating branch.
struct SenderWorker {
    fanout: Fanout,
    queue: Receiver<Vec<u8>>,
    guid: Uuid,
    fault: Arc<Mutex<Option<String>>>,
    cancel: CancelToken,
}

impl SenderWorker {
    fn run(mut self) {
        info!("output send thread started");

        loop {
            match self.queue.recv_timeout(QUEUE_POLL) {
                Ok(payload) => {
                    if let Err(e) = self
                        .fanout
                        .send_to_all(&[self.guid.as_bytes(), &payload])
                    {
                        let message = e.to_string();
                        warn!("output sender fault: {message}");
                        let mut fault = self.fault.lock().expect("fault slot lock poisoned");
                        if fault.is_none() {
                            *fault = Some(message);
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.fired() {
                        debug!("output sender observed cancellation");
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.fanout.shutdown();
        info!("output send thread shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Beacon, DiscoveryConfig, free_udp_port};
    use crate::net::format_endpoint_uri;
    use crate::net::frame::read_message;
    use std::net::TcpListener;

    #[test]
    fn test_output_step_discovers_and_fans_out() {
        let port = free_udp_port();

        // Stand-in downstream pipeline: a beacon that acknowledges with the
        // URI of a plain TCP listener.
        let data_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let data_uri = format_endpoint_uri(data_listener.local_addr().unwrap());
        let beacon_thread = thread::spawn(move || {
            Beacon::new(
                "receiver".into(),
                1,
                data_uri,
                DiscoveryConfig::loopback(port),
            )
            .run(&CancelToken::new())
        });

        let mut output = OutputStep::new("emitter".into(), vec!["receiver".into()], port);
        output.set_cancel(CancelToken::new());
        output.awaken().unwrap();

        let peers = beacon_thread.join().unwrap().unwrap();
        assert_eq!(peers[0].name, "emitter");
        assert_eq!(peers[0].guid, output.connection_guid());

        // Null payloads are dropped, real ones arrive framed with the guid.
        output.send(None).unwrap();
        output.send(Some(b"first".to_vec())).unwrap();
        output.send(Some(b"second".to_vec())).unwrap();

        let (mut stream, _) = data_listener.accept().unwrap();
        let first = read_message(&mut stream).unwrap();
        assert_eq!(first[0], output.connection_guid().as_bytes());
        assert_eq!(first[1], b"first");
        let second = read_message(&mut stream).unwrap();
        assert_eq!(second[1], b"second");

        output.end();
        output.end();
        assert!(output.send(Some(b"late".to_vec())).is_err());
    }
}
