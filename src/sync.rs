//! Cancellation and thread-completion signalling.
//!
//! One [`CancelToken`] is shared by the driver, every step, and every
//! background thread of a pipeline process. Background threads additionally
//! hand their owner a [`DoneReceiver`] so shutdown can join them with a
//! bounded wait instead of blocking forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

/// Cooperative cancellation signal.
///
/// Cloning is cheap; all clones observe the same flag. Once fired the token
/// stays fired for the rest of the process.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    fired: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Held by a background thread for its whole lifetime; dropping it (normal
/// return or panic) releases the paired [`DoneReceiver`].
pub struct DoneSender {
    _tx: Sender<()>,
}

/// Waits for the paired thread to finish, up to a deadline.
pub struct DoneReceiver {
    rx: Receiver<()>,
}

impl DoneReceiver {
    /// Returns true once the paired [`DoneSender`] has been dropped, false if
    /// the timeout elapsed first.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Creates a completion pair for joining a background thread with a bounded
/// wait.
pub fn done_pair() -> (DoneSender, DoneReceiver) {
    let (tx, rx) = bounded(0);
    (DoneSender { _tx: tx }, DoneReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.fired());
        token.fire();
        assert!(clone.fired());
    }

    #[test]
    fn test_done_pair_signals_on_drop() {
        let (done_tx, done_rx) = done_pair();
        let handle = thread::spawn(move || {
            let _held = done_tx;
            thread::sleep(Duration::from_millis(10));
        });
        assert!(done_rx.wait(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn test_done_pair_times_out_while_thread_runs() {
        let (done_tx, done_rx) = done_pair();
        assert!(!done_rx.wait(Duration::from_millis(20)));
        drop(done_tx);
        assert!(done_rx.wait(Duration::from_millis(20)));
    }
}
