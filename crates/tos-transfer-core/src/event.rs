//! Event delivery
//!
//! Three observer channels: byte-level data transfer events, part lifecycle
//! events and progress snapshots. Dispatch happens synchronously on the
//! emitting task and is serialized by one mutex, so every observer sees the
//! events of a transfer in one order.
//!
//! Once a terminal [`DataTransferEvent`] (`Succeed`, `Failed` or `Cancelled`)
//! is delivered the bus is sealed and every later event is dropped.
//! Observers must not emit on the bus they are subscribed to.

use crate::error::TransferError;
use crate::progress::TransferProgress;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tos_transfer_files::ByteRange;

/// Byte-level transfer events
#[derive(Debug, Clone, PartialEq)]
pub enum DataTransferEvent {
    /// First event of every transfer, except one cancelled before it began
    Started {
        /// Payload length, `None` for streams of unknown length
        total_bytes: Option<u64>,
    },
    /// Bytes moved
    Rw {
        /// Bytes in this step
        rw_once_bytes: u64,
        /// Running total, never decreasing
        consumed_bytes: u64,
        /// Payload length, `None` for streams of unknown length
        total_bytes: Option<u64>,
    },
    /// Transfer finalized
    Succeed {
        /// Bytes transferred in total
        total_bytes: u64,
    },
    /// Transfer failed; the checkpoint is kept
    Failed {
        /// Terminal error
        error: TransferError,
    },
    /// Cancellation acknowledged; the checkpoint is kept
    Cancelled,
}

impl DataTransferEvent {
    /// Whether no event may follow this one
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Part and staging-file lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum PartEvent {
    /// Multipart upload initiated
    MultipartCreated {
        /// Service-assigned upload id
        upload_id: String,
    },
    /// Initiating the multipart upload failed
    CreateMultipartFailed {
        /// Cause
        error: TransferError,
    },
    /// Existing multipart upload reused from a checkpoint
    MultipartResumed {
        /// Service-assigned upload id
        upload_id: String,
        /// Parts already done
        completed_parts: usize,
    },
    /// A part finished
    PartSucceeded {
        /// Zero-based part index
        index: u32,
        /// Bytes covered by the part
        range: ByteRange,
    },
    /// An attempt of a part failed
    PartFailed {
        /// Zero-based part index
        index: u32,
        /// Attempt number, starting at 1
        attempt: u32,
        /// Cause
        error: TransferError,
    },
    /// A part was abandoned because the transfer stopped
    PartAborted {
        /// Zero-based part index
        index: u32,
    },
    /// Multipart upload completed
    MultipartCompleted,
    /// Completing the multipart upload failed
    CompleteMultipartFailed {
        /// Cause
        error: TransferError,
    },
    /// Multipart upload aborted on the service
    MultipartAborted {
        /// Service-assigned upload id
        upload_id: String,
    },
    /// Download staging file created
    TempFileCreated {
        /// Staging file
        path: PathBuf,
    },
    /// Creating the staging file failed
    CreateTempFileFailed {
        /// Cause
        error: TransferError,
    },
    /// Staging file published to the destination
    TempFileRenamed {
        /// Destination
        path: PathBuf,
    },
    /// Publishing the staging file failed
    RenameTempFileFailed {
        /// Cause
        error: TransferError,
    },
}

/// Receives events of type `E`
pub trait Observer<E>: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &E);
}

impl<E, F> Observer<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

#[derive(Default)]
struct Subscribers {
    sealed: bool,
    data: Vec<Arc<dyn Observer<DataTransferEvent>>>,
    parts: Vec<Arc<dyn Observer<PartEvent>>>,
    progress: Vec<Arc<dyn Observer<TransferProgress>>>,
}

/// Ordered fan-out of transfer events to registered observers
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Subscribers>,
}

impl EventBus {
    /// Create a bus with no observers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data transfer observer
    pub fn subscribe_data(&self, observer: impl Observer<DataTransferEvent> + 'static) {
        self.inner.lock().data.push(Arc::new(observer));
    }

    /// Register a part lifecycle observer
    pub fn subscribe_parts(&self, observer: impl Observer<PartEvent> + 'static) {
        self.inner.lock().parts.push(Arc::new(observer));
    }

    /// Register a progress observer
    pub fn subscribe_progress(&self, observer: impl Observer<TransferProgress> + 'static) {
        self.inner.lock().progress.push(Arc::new(observer));
    }

    /// Deliver a data transfer event; returns false if the bus is sealed
    pub fn emit_data(&self, event: DataTransferEvent) -> bool {
        let mut subs = self.inner.lock();
        if subs.sealed {
            tracing::trace!("Dropping {:?} after terminal event", event);
            return false;
        }
        if event.is_terminal() {
            subs.sealed = true;
        }
        for observer in &subs.data {
            observer.on_event(&event);
        }
        true
    }

    /// Deliver a part event; returns false if the bus is sealed
    pub fn emit_part(&self, event: PartEvent) -> bool {
        let subs = self.inner.lock();
        if subs.sealed {
            return false;
        }
        for observer in &subs.parts {
            observer.on_event(&event);
        }
        true
    }

    /// Deliver a progress snapshot; returns false if the bus is sealed
    pub fn emit_progress(&self, progress: TransferProgress) -> bool {
        let subs = self.inner.lock();
        if subs.sealed {
            return false;
        }
        for observer in &subs.progress {
            observer.on_event(&progress);
        }
        true
    }

    /// Whether a terminal event has been delivered
    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs = self.inner.lock();
        f.debug_struct("EventBus")
            .field("sealed", &subs.sealed)
            .field("data_observers", &subs.data.len())
            .field("part_observers", &subs.parts.len())
            .field("progress_observers", &subs.progress.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_bus() -> (EventBus, Arc<Mutex<Vec<DataTransferEvent>>>) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_data(move |e: &DataTransferEvent| sink.lock().push(e.clone()));
        (bus, seen)
    }

    #[test]
    fn test_no_observers() {
        let bus = EventBus::new();
        assert!(bus.emit_data(DataTransferEvent::Started {
            total_bytes: Some(1)
        }));
        assert!(bus.emit_part(PartEvent::MultipartCompleted));
    }

    #[test]
    fn test_fan_out_in_order() {
        let (bus, seen) = recording_bus();
        let second = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&second);
        bus.subscribe_data(move |_: &DataTransferEvent| *counter.lock() += 1);

        bus.emit_data(DataTransferEvent::Started {
            total_bytes: Some(10),
        });
        bus.emit_data(DataTransferEvent::Rw {
            rw_once_bytes: 10,
            consumed_bytes: 10,
            total_bytes: Some(10),
        });

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(*second.lock(), 2);
    }

    #[test]
    fn test_sealed_after_terminal() {
        let (bus, seen) = recording_bus();
        let parts = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&parts);
        bus.subscribe_parts(move |_: &PartEvent| *counter.lock() += 1);

        assert!(bus.emit_data(DataTransferEvent::Cancelled));
        assert!(bus.is_sealed());

        assert!(!bus.emit_data(DataTransferEvent::Succeed { total_bytes: 0 }));
        assert!(!bus.emit_part(PartEvent::PartAborted { index: 0 }));
        assert!(!bus.emit_progress(TransferProgress::new(None, None)));

        assert_eq!(*seen.lock(), vec![DataTransferEvent::Cancelled]);
        assert_eq!(*parts.lock(), 0);
    }

    struct Counting(Mutex<u32>);

    impl Observer<TransferProgress> for Counting {
        fn on_event(&self, _event: &TransferProgress) {
            *self.0.lock() += 1;
        }
    }

    #[test]
    fn test_struct_observer() {
        let bus = EventBus::new();
        let counting = Arc::new(Counting(Mutex::new(0)));

        struct Forward(Arc<Counting>);
        impl Observer<TransferProgress> for Forward {
            fn on_event(&self, event: &TransferProgress) {
                self.0.on_event(event);
            }
        }

        bus.subscribe_progress(Forward(Arc::clone(&counting)));
        bus.emit_progress(TransferProgress::new(Some(5), Some(1)));
        assert_eq!(*counting.0.lock(), 1);
    }
}
