//! Per-source fan-in queues.
//!
//! The input step's background receiver deposits payloads by connection id;
//! the driver pops one message per source per iteration. The source set is
//! fixed once discovery completes ([`FanInBuffer::install`]); payloads that
//! arrive earlier are staged and drained into the queues at install time so
//! an eager upstream cannot lose messages.
//!
//! Display names are disambiguated once, at install: repeated occurrences of
//! a name get ` (1)`, ` (2)`, … suffixes in input order and never change
//! afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, warn};
use uuid::Uuid;

struct SourceQueue {
    display_name: String,
    depth: AtomicUsize,
    queue: Mutex<VecDeque<Vec<u8>>>,
}

struct Installed {
    /// Queue index per connection id.
    by_guid: HashMap<Uuid, usize>,
    /// Queues in fixed, disambiguated input order.
    queues: Vec<SourceQueue>,
}

#[derive(Default)]
pub struct FanInBuffer {
    installed: OnceLock<Installed>,
    staging: Mutex<Vec<(Uuid, Vec<u8>)>>,
}

impl FanInBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the source set. Messages staged before this point are drained
    /// into their queues in arrival order.
    pub fn install(&self, sources: &[(Uuid, String)]) {
        let names: Vec<&str> = sources.iter().map(|(_, name)| name.as_str()).collect();
        let display_names = disambiguate(&names);

        let mut by_guid = HashMap::with_capacity(sources.len());
        let mut queues = Vec::with_capacity(sources.len());
        for ((guid, _), display_name) in sources.iter().zip(display_names) {
            by_guid.insert(*guid, queues.len());
            queues.push(SourceQueue {
                display_name,
                depth: AtomicUsize::new(0),
                queue: Mutex::new(VecDeque::new()),
            });
        }

        // The staging lock is held across publishing the source set and
        // draining: a concurrent deposit either stages before the drain
        // (and is drained here, in order) or routes to the queues after
        // it. Nothing is lost and per-source order holds.
        let mut staging = self.staging.lock().expect("staging lock poisoned");
        if self
            .installed
            .set(Installed { by_guid, queues })
            .is_err()
        {
            warn!("fan-in source set is already installed");
            return;
        }
        let installed = self.installed.get().expect("just installed");

        let staged = std::mem::take(&mut *staging);
        if !staged.is_empty() {
            debug!("draining {} staged message(s) into fan-in queues", staged.len());
        }
        for (guid, payload) in staged {
            Self::enqueue(installed, guid, payload);
        }
    }

    /// Enqueues a payload for its source, or stages it while discovery is
    /// still running. Payloads from unknown sources are dropped.
    pub fn deposit(&self, guid: Uuid, payload: Vec<u8>) {
        // Routing is decided under the staging lock so it cannot race the
        // install-time drain; see install.
        let mut staging = self.staging.lock().expect("staging lock poisoned");
        match self.installed.get() {
            Some(installed) => Self::enqueue(installed, guid, payload),
            None => staging.push((guid, payload)),
        }
    }

    fn enqueue(installed: &Installed, guid: Uuid, payload: Vec<u8>) {
        match installed.by_guid.get(&guid) {
            Some(&index) => {
                let source = &installed.queues[index];
                source
                    .queue
                    .lock()
                    .expect("source queue lock poisoned")
                    .push_back(payload);
                source.depth.fetch_add(1, Ordering::Release);
            }
            None => warn!("dropping message from unknown source {guid}"),
        }
    }

    /// Queue depth without taking the queue lock.
    pub fn depth(&self, guid: &Uuid) -> usize {
        self.source(guid)
            .map(|source| source.depth.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn try_pop(&self, guid: &Uuid) -> Option<Vec<u8>> {
        let source = self.source(guid)?;
        let popped = source
            .queue
            .lock()
            .expect("source queue lock poisoned")
            .pop_front();
        if popped.is_some() {
            source.depth.fetch_sub(1, Ordering::Release);
        }
        popped
    }

    /// `(guid, display name)` pairs in the fixed install order. Empty until
    /// installed.
    pub fn sources(&self) -> Vec<(Uuid, String)> {
        match self.installed.get() {
            Some(installed) => {
                let mut ordered = vec![(Uuid::nil(), String::new()); installed.queues.len()];
                for (guid, &index) in &installed.by_guid {
                    ordered[index] = (*guid, installed.queues[index].display_name.clone());
                }
                ordered
            }
            None => Vec::new(),
        }
    }

    fn source(&self, guid: &Uuid) -> Option<&SourceQueue> {
        let installed = self.installed.get()?;
        installed
            .by_guid
            .get(guid)
            .map(|&index| &installed.queues[index])
    }
}

/// Display names for a source list: the first occurrence of a name keeps it,
/// later occurrences get ` (1)`, ` (2)`, … in input order.
pub fn disambiguate(names: &[&str]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    names
        .iter()
        .map(|name| {
            let count = counts.entry(name).or_insert(0);
            *count += 1;
            if *count == 1 {
                (*name).to_string()
            } else {
                format!("{name} ({})", *count - 1)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn test_disambiguation_preserves_order() {
        assert_eq!(
            disambiguate(&["alpha", "beta", "alpha", "alpha"]),
            vec!["alpha", "beta", "alpha (1)", "alpha (2)"]
        );
        assert_eq!(disambiguate(&["solo"]), vec!["solo"]);
        assert!(disambiguate(&[]).is_empty());
    }

    #[test]
    fn test_deposit_and_pop_fifo() {
        let buffer = FanInBuffer::new();
        buffer.install(&[(guid(1), "alpha".into())]);

        buffer.deposit(guid(1), b"first".to_vec());
        buffer.deposit(guid(1), b"second".to_vec());
        assert_eq!(buffer.depth(&guid(1)), 2);

        assert_eq!(buffer.try_pop(&guid(1)).unwrap(), b"first");
        assert_eq!(buffer.try_pop(&guid(1)).unwrap(), b"second");
        assert!(buffer.try_pop(&guid(1)).is_none());
        assert_eq!(buffer.depth(&guid(1)), 0);
    }

    #[test]
    fn test_staged_messages_survive_install() {
        let buffer = FanInBuffer::new();
        buffer.deposit(guid(1), b"early-1".to_vec());
        buffer.deposit(guid(1), b"early-2".to_vec());

        buffer.install(&[(guid(1), "alpha".into())]);
        assert_eq!(buffer.depth(&guid(1)), 2);
        assert_eq!(buffer.try_pop(&guid(1)).unwrap(), b"early-1");
        assert_eq!(buffer.try_pop(&guid(1)).unwrap(), b"early-2");
    }

    #[test]
    fn test_unknown_source_dropped() {
        let buffer = FanInBuffer::new();
        buffer.install(&[(guid(1), "alpha".into())]);
        buffer.deposit(guid(9), b"stray".to_vec());
        assert_eq!(buffer.depth(&guid(9)), 0);
    }

    #[test]
    fn test_sources_report_display_names() {
        let buffer = FanInBuffer::new();
        buffer.install(&[
            (guid(1), "dup".into()),
            (guid(2), "dup".into()),
            (guid(3), "other".into()),
        ]);
        let sources = buffer.sources();
        assert_eq!(
            sources,
            vec![
                (guid(1), "dup".to_string()),
                (guid(2), "dup (1)".to_string()),
                (guid(3), "other".to_string()),
            ]
        );
    }
}
