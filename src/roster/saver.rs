/// Debounced save scheduling on tokio.
///
/// `schedule_save()` is a non-blocking channel send. A background task waits
/// for the first request, sleeps for the configured delay, drains whatever
/// piled up meanwhile and emits one `SaveTick`. The task that owns the roster
/// selects on the tick receiver and performs the actual write, so the roster
/// itself never awaits I/O and never leaves its task.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::roster::contract::PersistenceAdapter;

/// One coalesced save request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveTick {
    /// 1 for the first tick, counting up.
    pub generation: u64,
    /// How many `schedule_save` calls this tick answers.
    pub coalesced: usize,
}

#[derive(Clone, Debug)]
pub struct SaveDebouncer {
    requests: mpsc::UnboundedSender<()>,
}

impl SaveDebouncer {
    /// Start the coalescing task on the current runtime.
    ///
    /// The task ends when every `SaveDebouncer` clone is dropped or the tick
    /// receiver goes away.
    pub fn spawn(delay: Duration) -> (Self, mpsc::UnboundedReceiver<SaveTick>) {
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<()>();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut generation = 0u64;
            while req_rx.recv().await.is_some() {
                sleep(delay).await;
                let mut coalesced = 1usize;
                while req_rx.try_recv().is_ok() {
                    coalesced += 1;
                }
                generation += 1;
                log::debug!("save tick {} ({} request(s))", generation, coalesced);
                if tick_tx.send(SaveTick { generation, coalesced }).is_err() {
                    break;
                }
            }
            log::debug!("save debouncer stopped");
        });

        (SaveDebouncer { requests: req_tx }, tick_rx)
    }
}

impl PersistenceAdapter for SaveDebouncer {
    fn schedule_save(&self) {
        if self.requests.send(()).is_err() {
            log::warn!("save debouncer is gone; dropping save request");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
