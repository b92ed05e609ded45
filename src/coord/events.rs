//! Observer notifications
//!
//! Events are fire-and-forget: the bus never waits for subscribers. A slow
//! subscriber loses its oldest buffered events instead of stalling a run.

use async_broadcast::{InactiveReceiver, Receiver, RecvError, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coord::types::{BlockResult, MergeConflict, RunState, RunStatus, Worker};

/// Notification kinds emitted by the coordinator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    StatusChanged {
        status: RunStatus,
    },
    WorkerUpdated {
        worker: Worker,
    },
    Progress {
        progress: u8,
    },
    BlockCompleted {
        block_id: String,
        result: BlockResult,
    },
    ConflictDetected {
        conflict: MergeConflict,
    },
    RunComplete {
        state: Box<RunState>,
    },
    RunError {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusChanged,
    WorkerUpdated,
    Progress,
    BlockCompleted,
    ConflictDetected,
    RunComplete,
    RunError,
}

impl CoordinatorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StatusChanged { .. } => EventKind::StatusChanged,
            Self::WorkerUpdated { .. } => EventKind::WorkerUpdated,
            Self::Progress { .. } => EventKind::Progress,
            Self::BlockCompleted { .. } => EventKind::BlockCompleted,
            Self::ConflictDetected { .. } => EventKind::ConflictDetected,
            Self::RunComplete { .. } => EventKind::RunComplete,
            Self::RunError { .. } => EventKind::RunError,
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub run_id: String,
    pub timestamp_ms: i64,
    pub event: CoordinatorEvent,
}

/// Broadcast channel shared by every subscriber
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    // Keeps the channel open while nobody is subscribed
    _keepalive: InactiveReceiver<EventEnvelope>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true);
        Self {
            sender,
            _keepalive: receiver.deactivate(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Start receiving every event emitted from now on. Drop the receiver to
    /// unsubscribe.
    pub fn subscribe(&self) -> Receiver<EventEnvelope> {
        self.sender.new_receiver()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, run_id: &str, event: CoordinatorEvent) {
        let envelope = EventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            run_id: run_id.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event,
        };
        match self.sender.try_broadcast(envelope) {
            Ok(Some(dropped)) => {
                debug!("Event buffer full, dropped event #{}", dropped.sequence)
            }
            Ok(None) => {}
            // No active subscribers or already disposed
            Err(TrySendError::Inactive(_)) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => warn!("Event channel full, event dropped"),
        }
    }

    /// Close the channel; every subscriber sees the stream end
    pub fn close(&self) -> bool {
        self.sender.close()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Drain a subscription into `tracing` until the bus is closed
pub fn spawn_event_logger(mut receiver: Receiver<EventEnvelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => log_event(&envelope),
                Err(RecvError::Overflowed(missed)) => {
                    warn!("Event logger fell behind, {} events skipped", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(envelope: &EventEnvelope) {
    let run_id = envelope.run_id.as_str();
    match &envelope.event {
        CoordinatorEvent::StatusChanged { status } => {
            info!(run_id, "Run status: {:?}", status);
        }
        CoordinatorEvent::WorkerUpdated { worker } => {
            debug!(run_id, worker_id = %worker.id, "Worker {:?}", worker.status);
        }
        CoordinatorEvent::Progress { progress } => {
            debug!(run_id, "Progress {}%", progress);
        }
        CoordinatorEvent::BlockCompleted { block_id, result } => {
            info!(
                run_id,
                block_id = %block_id,
                tokens = result.execution.tokens_used,
                "Block completed"
            );
        }
        CoordinatorEvent::ConflictDetected { conflict } => {
            warn!(
                run_id,
                "Conflict on {}: {} vs {}", conflict.file, conflict.first_block, conflict.second_block
            );
        }
        CoordinatorEvent::RunComplete { state } => {
            info!(run_id, "Run finished with status {:?}", state.status);
        }
        CoordinatorEvent::RunError { message } => {
            error!(run_id, "Run error: {}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit("run", CoordinatorEvent::Progress { progress: 10 });
        bus.emit("run", CoordinatorEvent::Progress { progress: 20 });

        for rx in [&mut first, &mut second] {
            let a = rx.recv().await.unwrap();
            let b = rx.recv().await.unwrap();
            assert_eq!(a.event.kind(), EventKind::Progress);
            assert!(a.sequence < b.sequence);
            assert!(matches!(b.event, CoordinatorEvent::Progress { progress: 20 }));
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit("run", CoordinatorEvent::RunError { message: "x".into() });

        let mut late = bus.subscribe();
        bus.emit("run", CoordinatorEvent::Progress { progress: 1 });
        let env = late.recv().await.unwrap();
        assert!(matches!(env.event, CoordinatorEvent::Progress { progress: 1 }));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);

        let mut rx = bus.subscribe();
        assert!(bus.close());
        assert!(bus.is_closed());
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for p in 0..5u8 {
            bus.emit("run", CoordinatorEvent::Progress { progress: p });
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Overflowed(3))));
        let env = rx.recv().await.unwrap();
        assert!(matches!(env.event, CoordinatorEvent::Progress { progress: 3 }));
    }
}
