//! Configuration for voxstream

use std::time::Duration;

/// Tuning for a [`StreamSession`](crate::StreamSession) and the pumps it creates.
#[derive(Debug, Clone)]
pub struct StreamerDesc {
    /// Voice capacity assumed when the backend does not report one
    pub default_max_voices: usize,
    /// Number of buffers allocated by the first fill of a new stream
    pub initial_buffer_count: usize,
    /// Byte capacity of a single streaming buffer
    pub buffer_bytes: usize,
    /// Upper bound on the audio held by a single buffer.
    /// Larger values skip less but delay `stop()` longer.
    pub max_buffer_time: Duration,
    /// Stream events held until the host calls `poll_events`
    pub event_capacity: usize,
}

impl Default for StreamerDesc {
    fn default() -> Self {
        Self {
            default_max_voices: 16,
            initial_buffer_count: 4,
            buffer_bytes: 0x4000,
            max_buffer_time: Duration::from_millis(50),
            event_capacity: 256,
        }
    }
}

impl StreamerDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_max_voices(mut self, voices: usize) -> Self {
        self.default_max_voices = voices;
        self
    }

    /// At least one buffer is always allocated.
    pub fn initial_buffer_count(mut self, count: usize) -> Self {
        self.initial_buffer_count = count.max(1);
        self
    }

    pub fn buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes;
        self
    }

    pub fn max_buffer_time(mut self, time: Duration) -> Self {
        self.max_buffer_time = time;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Frames that fit in one buffer for a source with the given layout.
    ///
    /// Bounded both by [`buffer_bytes`](Self::buffer_bytes) and by
    /// [`max_buffer_time`](Self::max_buffer_time), and never less than one frame.
    pub fn frames_per_buffer(&self, frame_rate: u32, frame_size: usize) -> usize {
        let by_bytes = self.buffer_bytes / frame_size.max(1);
        let by_time = (frame_rate as u128 * self.max_buffer_time.as_millis() / 1000) as usize;
        by_bytes.min(by_time).max(1)
    }
}

/// Configuration for the in-process [`SoftwareBackend`](crate::backend::SoftwareBackend).
#[derive(Debug, Clone)]
pub struct SoftwareBackendDesc {
    /// Rate at which `render`/`advance` consume time
    pub output_sample_rate: u32,
    /// Interleaved channel count produced by `render`
    pub output_channels: u16,
    /// Concurrent voices the device accepts; reported as its mono voice capacity.
    /// `None` makes the device report no capacity at all.
    pub max_voices: Option<usize>,
}

impl Default for SoftwareBackendDesc {
    fn default() -> Self {
        Self {
            output_sample_rate: 48000,
            output_channels: 2,
            max_voices: Some(32),
        }
    }
}

impl SoftwareBackendDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_sample_rate(mut self, rate: u32) -> Self {
        self.output_sample_rate = rate;
        self
    }

    pub fn output_channels(mut self, channels: u16) -> Self {
        self.output_channels = channels;
        self
    }

    pub fn max_voices(mut self, max: Option<usize>) -> Self {
        self.max_voices = max;
        self
    }
}
