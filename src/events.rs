//! Event types for voxstream

use crate::session::StreamId;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StreamStarted { stream_id: StreamId },
    /// Source exhausted and every queued buffer played
    StreamCompleted { stream_id: StreamId },
    /// Removed by an explicit stop
    StreamStopped { stream_id: StreamId },
    /// A backend call failed while pumping; the stream was dropped
    StreamFailed { stream_id: StreamId, error: String },
}

impl StreamEvent {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::StreamStarted { stream_id }
            | Self::StreamCompleted { stream_id }
            | Self::StreamStopped { stream_id }
            | Self::StreamFailed { stream_id, .. } => *stream_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::StreamFailed { .. })
    }

    /// True for events after which the stream id is no longer live
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::StreamStarted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_started_keeps_stream_live() {
        let id = StreamId::from_raw(3);
        assert!(!StreamEvent::StreamStarted { stream_id: id }.is_terminal());
        assert!(StreamEvent::StreamCompleted { stream_id: id }.is_terminal());
        assert!(StreamEvent::StreamStopped { stream_id: id }.is_terminal());

        let failed = StreamEvent::StreamFailed {
            stream_id: id,
            error: "queue_buffer failed".into(),
        };
        assert!(failed.is_terminal());
        assert!(failed.is_error());
        assert_eq!(failed.stream_id(), id);
    }
}
