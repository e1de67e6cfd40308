//! Playback backend abstraction.
//!
//! The [`Backend`] trait mirrors the handful of calls a streaming engine needs from
//! an OpenAL-style voice API:
//! - device and context lifecycle
//! - voice and buffer allocation
//! - buffer upload and queueing
//! - per-voice gain and position, listener gain
//! - play state and processed/queued buffer counts
//!
//! [`SoftwareBackend`] is an in-process implementation that can be driven by a
//! [`CpalOutput`] stream or advanced manually.

mod cpal_output;
mod software;

pub use cpal_output::CpalOutput;
pub use software::SoftwareBackend;

use crate::math::Vec3;
use crate::source::AudioSource;
use thiserror::Error;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(&self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// An open output device
    DeviceHandle
);
handle!(
    /// A playback context created on a device
    ContextHandle
);
handle!(
    /// A playback voice (an OpenAL "source")
    VoiceId
);
handle!(
    /// A PCM buffer that can be queued on a voice
    BufferId
);

/// Backend error codes, numbered like their OpenAL counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidName,
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    OutOfMemory,
    /// Device-level failure with a backend specific code
    Device(u32),
}

impl ErrorCode {
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidName => 0xA001,
            Self::InvalidEnum => 0xA002,
            Self::InvalidValue => 0xA003,
            Self::InvalidOperation => 0xA004,
            Self::OutOfMemory => 0xA005,
            Self::Device(code) => *code,
        }
    }
}

/// A failed backend call: which operation and the code it reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed: {code:?} (0x{raw:x})", raw = .code.code())]
pub struct BackendError {
    pub op: &'static str,
    pub code: ErrorCode,
}

impl BackendError {
    pub fn new(op: &'static str, code: ErrorCode) -> Self {
        Self { op, code }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// PCM layout of an uploaded buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Mono8,
    Stereo8,
    Mono16,
    Stereo16,
}

impl SampleFormat {
    pub fn from_layout(sample_size: u16, channels: u16) -> Option<Self> {
        match (sample_size, channels) {
            (1, 1) => Some(Self::Mono8),
            (1, 2) => Some(Self::Stereo8),
            (2, 1) => Some(Self::Mono16),
            (2, 2) => Some(Self::Stereo16),
            _ => None,
        }
    }

    pub fn for_source(source: &dyn AudioSource) -> Option<Self> {
        Self::from_layout(source.sample_size(), source.channel_count())
    }

    pub fn channels(&self) -> usize {
        match self {
            Self::Mono8 | Self::Mono16 => 1,
            Self::Stereo8 | Self::Stereo16 => 2,
        }
    }

    pub fn sample_size(&self) -> usize {
        match self {
            Self::Mono8 | Self::Stereo8 => 1,
            Self::Mono16 | Self::Stereo16 => 2,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.channels() * self.sample_size()
    }
}

/// Play state reported for a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// Never started
    Initial,
    Playing,
    Stopped,
}

/// One entry of a device attribute list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttribute {
    Frequency(u32),
    MonoVoices(u32),
    StereoVoices(u32),
    Other(i32, i32),
}

/// An OpenAL-shaped playback backend.
///
/// Calls take `&self`: a backend behaves like process-wide native state and is
/// shared between the device manager and every stream pump through an `Arc`.
pub trait Backend {
    fn open_device(&self) -> BackendResult<DeviceHandle>;
    fn close_device(&self, device: DeviceHandle);
    fn create_context(&self, device: DeviceHandle) -> BackendResult<ContextHandle>;
    fn make_context_current(&self, context: Option<ContextHandle>) -> BackendResult<()>;
    fn destroy_context(&self, context: ContextHandle);
    fn device_attributes(&self, device: DeviceHandle) -> BackendResult<Vec<DeviceAttribute>>;

    fn create_voice(&self) -> BackendResult<VoiceId>;
    fn delete_voice(&self, voice: VoiceId) -> BackendResult<()>;
    fn create_buffer(&self) -> BackendResult<BufferId>;
    fn delete_buffer(&self, buffer: BufferId) -> BackendResult<()>;
    fn buffer_data(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        data: &[u8],
        frame_rate: u32,
    ) -> BackendResult<()>;

    fn queue_buffer(&self, voice: VoiceId, buffer: BufferId) -> BackendResult<()>;
    /// Removes the oldest processed buffer from the voice queue.
    fn unqueue_buffer(&self, voice: VoiceId) -> BackendResult<BufferId>;
    fn processed_buffers(&self, voice: VoiceId) -> BackendResult<usize>;
    fn queued_buffers(&self, voice: VoiceId) -> BackendResult<usize>;

    fn play(&self, voice: VoiceId) -> BackendResult<()>;
    fn stop(&self, voice: VoiceId) -> BackendResult<()>;
    fn voice_state(&self, voice: VoiceId) -> BackendResult<VoiceState>;

    fn set_gain(&self, voice: VoiceId, gain: f32) -> BackendResult<()>;
    fn set_position(&self, voice: VoiceId, position: Vec3) -> BackendResult<()>;

    fn set_listener_gain(&self, gain: f32) -> BackendResult<()>;
    fn listener_gain(&self) -> BackendResult<f32>;
}
