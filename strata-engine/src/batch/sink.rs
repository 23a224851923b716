//! Destinations for writes the scheduler gave up on

use crate::core::FailedWrite;
use tokio::sync::mpsc;
use tracing::error;

/// Receives every write that failed after the retry budget was spent
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: &FailedWrite);
}

/// Logs failures through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, failure: &FailedWrite) {
        error!(
            "Write to {} failed after {} attempt(s) in batch {}: {}{}",
            failure.op.key(),
            failure.attempts,
            failure.batch_id,
            failure.reason,
            if failure.superseded {
                " (superseded by a newer write)"
            } else {
                ""
            }
        );
    }
}

/// Forwards failures to a channel for collaborators that want to react
#[derive(Debug, Clone)]
pub struct ChannelErrorSink {
    tx: mpsc::UnboundedSender<FailedWrite>,
}

impl ChannelErrorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FailedWrite>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorSink for ChannelErrorSink {
    fn report(&self, failure: &FailedWrite) {
        if self.tx.send(failure.clone()).is_err() {
            // receiver gone; the failure still reaches the log
            TracingErrorSink.report(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WriteOp;

    fn failure() -> FailedWrite {
        FailedWrite {
            op: WriteOp::Delete {
                key: "user:1".to_string(),
            },
            attempts: 3,
            reason: "store unavailable".to_string(),
            batch_id: uuid::Uuid::new_v4(),
            failed_at: chrono::Utc::now(),
            superseded: false,
        }
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelErrorSink::new();
        sink.report(&failure());

        let received = rx.try_recv().unwrap();
        assert_eq!(received.op.key(), "user:1");
        assert_eq!(received.attempts, 3);
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelErrorSink::new();
        drop(rx);
        sink.report(&failure());
    }
}
