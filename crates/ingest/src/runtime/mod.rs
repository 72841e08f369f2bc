use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::IngestError;

pub mod flow_control;
pub mod kernel;

pub use flow_control::{FlowControlConfig, FlowController};
pub use kernel::{KernelRunStats, run_batch};

/// Opens a bounded intake channel. Producers hold [`IntakeHandle`]s, the
/// consumer drains the [`IntakeReceiver`] asynchronously or by polling.
pub fn intake_channel<T>(capacity: usize) -> (IntakeHandle<T>, IntakeReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IntakeHandle { tx }, IntakeReceiver { rx })
}

#[derive(Debug)]
pub struct IntakeHandle<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for IntakeHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> IntakeHandle<T> {
    pub async fn submit(&self, item: T) -> Result<(), IngestError> {
        self.tx
            .send(item)
            .await
            .map_err(|_| IngestError::IntakeClosed)
    }

    /// Blocks the current thread until there is room. Must not be called from
    /// within an async context.
    pub fn blocking_submit(&self, item: T) -> Result<(), IngestError> {
        self.tx
            .blocking_send(item)
            .map_err(|_| IngestError::IntakeClosed)
    }

    /// Returns the item back when the channel is full.
    pub fn try_submit(&self, item: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(item)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct IntakeReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> IntakeReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
