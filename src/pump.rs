//! Per-stream buffer pump.
//!
//! A [`StreamPump`] owns one [`AudioSource`] and one backend voice and keeps the
//! voice's buffer queue topped up:
//!
//! ```text
//! Uninitialized --init--> Initialized --fill--> Streaming --source empty--> Draining
//!                                                   |                          |
//!                                                   +------backend error-------+--> Stopped
//! ```
//!
//! Nothing here blocks or spawns; progress only happens when the owner calls
//! [`StreamPump::fill`].

use crate::backend::{Backend, BackendError, BufferId, SampleFormat, VoiceId, VoiceState};
use crate::config::StreamerDesc;
use crate::error::{Result, VoxStreamError};
use crate::math::VolumePan;
use crate::source::AudioSource;
use std::sync::Arc;

/// Lifecycle of a pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Uninitialized,
    /// Voice allocated, nothing queued yet
    Initialized,
    Streaming,
    /// Source exhausted; queued buffers are still playing
    Draining,
    /// A backend call failed
    Stopped,
}

/// Outcome of a successful [`StreamPump::fill`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// More data may follow
    Streaming,
    /// No more data will be queued
    Exhausted,
}

/// A buffer that has been taken out of the pool but not yet handed to the voice.
/// Dropping the guard deletes the buffer.
struct BufferGuard<'a, B: Backend> {
    backend: &'a B,
    buffer: BufferId,
    armed: bool,
}

impl<'a, B: Backend> BufferGuard<'a, B> {
    fn new(backend: &'a B, buffer: BufferId) -> Self {
        Self {
            backend,
            buffer,
            armed: true,
        }
    }

    fn id(&self) -> BufferId {
        self.buffer
    }

    /// The voice owns the buffer now.
    fn release(mut self) {
        self.armed = false;
    }
}

impl<B: Backend> Drop for BufferGuard<'_, B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.backend.delete_buffer(self.buffer) {
            log::error!("Failed to release buffer {:?}: {}", self.buffer, e);
        }
    }
}

pub struct StreamPump<B: Backend> {
    backend: Arc<B>,
    desc: StreamerDesc,
    source: Option<Box<dyn AudioSource>>,
    voice: Option<VoiceId>,
    format: Option<SampleFormat>,
    state: PumpState,
    /// Buffers still to be allocated by the first fill
    pending_new_buffers: usize,
    scratch: Vec<u8>,

    // Loop and fade requests are recorded but not acted on yet.
    looping: bool,
    loop_start_frame: u64,
    fade_frames: u64,
    fade_frames_played: u64,
}

impl<B: Backend> StreamPump<B> {
    pub fn new(backend: Arc<B>, desc: StreamerDesc) -> Self {
        Self {
            backend,
            desc,
            source: None,
            voice: None,
            format: None,
            state: PumpState::Uninitialized,
            pending_new_buffers: 0,
            scratch: Vec::new(),
            looping: false,
            loop_start_frame: 0,
            fade_frames: 0,
            fade_frames_played: 0,
        }
    }

    /// Allocate the voice and take ownership of `source`.
    ///
    /// On failure the source is dropped and no voice is left behind.
    pub fn init(&mut self, source: Box<dyn AudioSource>) -> Result<()> {
        if self.voice.is_some() {
            return Err(VoxStreamError::AlreadyInitialized("stream pump"));
        }

        let format = SampleFormat::for_source(source.as_ref()).ok_or_else(|| {
            VoxStreamError::SourceOpenFailed(format!(
                "unsupported layout: {} channels, {} byte samples",
                source.channel_count(),
                source.sample_size()
            ))
        })?;
        if source.frame_rate() == 0 {
            return Err(VoxStreamError::SourceOpenFailed(
                "frame rate must be positive".into(),
            ));
        }

        let voice = self
            .backend
            .create_voice()
            .map_err(VoxStreamError::VoiceAllocationFailed)?;

        log::debug!(
            "Voice {:?} allocated for {:?} at {} Hz",
            voice,
            format,
            source.frame_rate()
        );

        self.voice = Some(voice);
        self.format = Some(format);
        self.source = Some(source);
        self.state = PumpState::Initialized;
        Ok(())
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn voice(&self) -> Option<VoiceId> {
        self.voice
    }

    /// True until the source runs dry or a backend call fails
    pub fn is_streaming(&self) -> bool {
        matches!(self.state, PumpState::Initialized | PumpState::Streaming)
    }

    pub fn voice_state(&self) -> Result<VoiceState> {
        let voice = self
            .voice
            .ok_or(VoxStreamError::NotInitialized("stream pump"))?;
        Ok(self.backend.voice_state(voice)?)
    }

    /// Top up the voice queue.
    ///
    /// `new_buffer_count` buffers are allocated on top of whatever the voice has
    /// already processed; after that only processed buffers are recycled. Stops
    /// early (without error) when no buffer is available. Returns
    /// [`FillStatus::Exhausted`] once the source has nothing left; buffers that
    /// are already queued keep playing.
    ///
    /// A backend failure moves the pump to [`PumpState::Stopped`]. The caller
    /// should drop the pump afterwards.
    pub fn fill(&mut self, new_buffer_count: usize) -> Result<FillStatus> {
        if !self.is_streaming() {
            return Ok(FillStatus::Exhausted);
        }
        self.pending_new_buffers += new_buffer_count;

        match self.pump_buffers() {
            Ok(status) => Ok(status),
            Err(e) => {
                log::error!("Stream on voice {:?} stopped: {}", self.voice, e);
                self.state = PumpState::Stopped;
                self.pending_new_buffers = 0;
                Err(e.into())
            }
        }
    }

    fn pump_buffers(&mut self) -> std::result::Result<FillStatus, BackendError> {
        let (Some(voice), Some(format)) = (self.voice, self.format) else {
            return Ok(FillStatus::Exhausted);
        };
        let Some(source) = self.source.as_mut() else {
            return Ok(FillStatus::Exhausted);
        };
        let backend = self.backend.as_ref();

        let frame_rate = source.frame_rate();
        let frame_size = source.frame_size();
        let space_frames = self.desc.frames_per_buffer(frame_rate, frame_size);
        self.scratch.resize(space_frames * frame_size, 0);

        let mut status = FillStatus::Streaming;
        let mut queued = 0;

        loop {
            let buffer = if self.pending_new_buffers > 0 {
                let buffer = backend.create_buffer()?;
                self.pending_new_buffers -= 1;
                buffer
            } else {
                if backend.processed_buffers(voice)? == 0 {
                    break;
                }
                backend.unqueue_buffer(voice)?
            };
            let guard = BufferGuard::new(backend, buffer);

            let frames = match source.read(&mut self.scratch, space_frames) {
                Ok(frames) => frames,
                Err(e) => {
                    log::warn!("Source read failed on voice {:?}, ending stream: {}", voice, e);
                    0
                }
            };

            // TODO: rewind to loop_start_frame here once looping sources exist.
            if frames == 0 {
                log::debug!("Voice {:?} source exhausted, draining", voice);
                status = FillStatus::Exhausted;
                break;
            }

            backend.buffer_data(
                guard.id(),
                format,
                &self.scratch[..frames * frame_size],
                frame_rate,
            )?;
            backend.queue_buffer(voice, guard.id())?;
            guard.release();
            queued += 1;
        }

        self.state = match status {
            FillStatus::Streaming => PumpState::Streaming,
            FillStatus::Exhausted => PumpState::Draining,
        };

        if queued > 0 {
            log::debug!("Voice {:?}: queued {} buffers", voice, queued);
        }

        self.ensure_playing(voice)?;
        Ok(status)
    }

    /// Start the voice if it is idle and has something queued.
    fn ensure_playing(&self, voice: VoiceId) -> std::result::Result<(), BackendError> {
        let backend = self.backend.as_ref();
        if backend.voice_state(voice)? == VoiceState::Playing {
            return Ok(());
        }

        // Starting a stopped voice replays its whole queue, so drop what it
        // has already played first.
        self.release_processed(voice)?;
        if backend.queued_buffers(voice)? > 0 {
            backend.play(voice)?;
        }
        Ok(())
    }

    /// Unqueue and delete every processed buffer.
    fn release_processed(&self, voice: VoiceId) -> std::result::Result<(), BackendError> {
        let backend = self.backend.as_ref();
        let count = backend.processed_buffers(voice)?;
        for _ in 0..count {
            let buffer = backend.unqueue_buffer(voice)?;
            backend.delete_buffer(buffer)?;
        }
        Ok(())
    }

    /// Silence the voice at once and release every buffer it holds.
    ///
    /// Safe to call more than once; each buffer is released exactly once.
    pub fn stop(&mut self) -> Result<()> {
        let voice = self
            .voice
            .ok_or(VoxStreamError::NotInitialized("stream pump"))?;

        self.backend.stop(voice)?;
        self.release_processed(voice)?;
        if self.is_streaming() {
            self.state = PumpState::Draining;
        }
        self.pending_new_buffers = 0;
        Ok(())
    }

    pub fn set_volume_pan(&mut self, volume_pan: VolumePan) -> Result<()> {
        let voice = self
            .voice
            .ok_or(VoxStreamError::NotInitialized("stream pump"))?;
        self.backend.set_gain(voice, volume_pan.gain())?;
        self.backend.set_position(voice, volume_pan.position())?;
        Ok(())
    }

    /// Record a loop point. Accepted but not applied: the stream still ends
    /// when its source does.
    pub fn set_looping(&mut self, loop_start_frame: u64) {
        log::debug!(
            "Voice {:?}: loop from frame {} requested (not applied)",
            self.voice,
            loop_start_frame
        );
        self.looping = true;
        self.loop_start_frame = loop_start_frame;
    }

    /// Record a fade-out request. Accepted but not applied.
    pub fn begin_fade_out(&mut self, fade_frames: u64) {
        log::debug!(
            "Voice {:?}: fade over {} frames requested (not applied)",
            self.voice,
            fade_frames
        );
        self.fade_frames = fade_frames;
        self.fade_frames_played = 0;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn loop_start_frame(&self) -> u64 {
        self.loop_start_frame
    }

    pub fn fade_frames(&self) -> u64 {
        self.fade_frames
    }

    pub fn fade_frames_played(&self) -> u64 {
        self.fade_frames_played
    }

    /// Source frame rate, once initialized
    pub fn frame_rate(&self) -> Option<u32> {
        self.source.as_ref().map(|s| s.frame_rate())
    }
}

impl<B: Backend> Drop for StreamPump<B> {
    fn drop(&mut self) {
        let Some(voice) = self.voice else {
            return;
        };
        if let Err(e) = self.stop() {
            log::error!("Failed to stop voice {:?}: {}", voice, e);
        }
        if let Err(e) = self.backend.delete_voice(voice) {
            log::error!("Failed to delete voice {:?}: {}", voice, e);
        }
        self.voice = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ErrorCode, SoftwareBackend};
    use crate::config::SoftwareBackendDesc;
    use crate::device::DeviceManager;
    use crate::math::Vec3;
    use crate::source::PcmSource;
    use std::time::Duration;

    fn setup() -> (Arc<SoftwareBackend>, DeviceManager<SoftwareBackend>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(SoftwareBackend::new(
            SoftwareBackendDesc::default().output_sample_rate(44100),
        ));
        let mut device = DeviceManager::new(backend.clone(), StreamerDesc::default());
        device.init().unwrap();
        (backend, device)
    }

    /// 44.1 kHz 16-bit stereo silence; 2205 frames (50 ms) per buffer
    fn source(duration: Duration) -> Box<dyn AudioSource> {
        Box::new(PcmSource::silence(duration, 44100, 2).unwrap())
    }

    fn pump(backend: &Arc<SoftwareBackend>) -> StreamPump<SoftwareBackend> {
        StreamPump::new(backend.clone(), StreamerDesc::default())
    }

    #[test]
    fn init_allocates_exactly_one_voice() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        assert_eq!(pump.state(), PumpState::Uninitialized);

        pump.init(source(Duration::from_secs(1))).unwrap();
        assert_eq!(pump.state(), PumpState::Initialized);
        assert_eq!(backend.live_voice_count(), 1);

        let again = pump.init(source(Duration::from_secs(1)));
        assert!(matches!(again, Err(VoxStreamError::AlreadyInitialized(_))));
        assert_eq!(backend.live_voice_count(), 1);
    }

    #[test]
    fn init_reports_voice_allocation_failure() {
        let (backend, _device) = setup();
        backend.inject_failure("create_voice", ErrorCode::OutOfMemory);
        let mut pump = pump(&backend);
        let result = pump.init(source(Duration::from_secs(1)));
        assert!(matches!(result, Err(VoxStreamError::VoiceAllocationFailed(_))));
        assert_eq!(pump.state(), PumpState::Uninitialized);
        assert_eq!(backend.live_voice_count(), 0);
    }

    #[test]
    fn initial_fill_queues_requested_buffers_and_starts_voice() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        pump.init(source(Duration::from_secs(1))).unwrap();

        assert_eq!(pump.fill(4).unwrap(), FillStatus::Streaming);
        assert_eq!(pump.state(), PumpState::Streaming);
        let voice = pump.voice().unwrap();
        assert_eq!(backend.queued_buffers(voice).unwrap(), 4);
        assert_eq!(backend.live_buffer_count(), 4);
        assert_eq!(pump.voice_state().unwrap(), VoiceState::Playing);
    }

    #[test]
    fn refill_only_recycles_processed_buffers() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        pump.init(source(Duration::from_secs(1))).unwrap();
        pump.fill(4).unwrap();

        // nothing processed yet: no new buffers appear
        pump.fill(0).unwrap();
        assert_eq!(backend.live_buffer_count(), 4);

        backend.advance(Duration::from_millis(110));
        pump.fill(0).unwrap();
        let voice = pump.voice().unwrap();
        assert_eq!(backend.queued_buffers(voice).unwrap(), 4);
        assert_eq!(backend.processed_buffers(voice).unwrap(), 0);
        assert_eq!(backend.live_buffer_count(), 4);
    }

    #[test]
    fn exhausted_source_drains_queued_buffers() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        // 2.5 buffers worth of audio
        pump.init(source(Duration::from_millis(125))).unwrap();

        assert_eq!(pump.fill(4).unwrap(), FillStatus::Exhausted);
        assert_eq!(pump.state(), PumpState::Draining);
        assert!(!pump.is_streaming());
        let voice = pump.voice().unwrap();
        assert_eq!(backend.queued_buffers(voice).unwrap(), 3);
        // the buffer that found the source empty was released
        assert_eq!(backend.live_buffer_count(), 3);
        assert_eq!(pump.voice_state().unwrap(), VoiceState::Playing);

        assert_eq!(pump.fill(0).unwrap(), FillStatus::Exhausted);
        backend.advance(Duration::from_millis(200));
        assert_eq!(pump.voice_state().unwrap(), VoiceState::Stopped);
    }

    #[test]
    fn starved_voice_is_restarted_with_fresh_data() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        pump.init(source(Duration::from_secs(1))).unwrap();
        pump.fill(2).unwrap();

        backend.advance(Duration::from_millis(300));
        assert_eq!(pump.voice_state().unwrap(), VoiceState::Stopped);

        assert_eq!(pump.fill(0).unwrap(), FillStatus::Streaming);
        let voice = pump.voice().unwrap();
        assert_eq!(backend.queued_buffers(voice).unwrap(), 2);
        assert_eq!(backend.processed_buffers(voice).unwrap(), 0);
        assert_eq!(pump.voice_state().unwrap(), VoiceState::Playing);
    }

    #[test]
    fn backend_error_stops_pump_without_leaking_buffer() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        pump.init(source(Duration::from_secs(1))).unwrap();
        backend.inject_failure_after("queue_buffer", ErrorCode::InvalidOperation, 2);

        let result = pump.fill(4);
        assert!(matches!(result, Err(VoxStreamError::BackendCallFailed(_))));
        assert_eq!(pump.state(), PumpState::Stopped);
        // two queued, the third was released by its guard, the fourth never made
        assert_eq!(backend.live_buffer_count(), 2);
        assert_eq!(pump.fill(0).unwrap(), FillStatus::Exhausted);

        drop(pump);
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_voice_count(), 0);
    }

    #[test]
    fn stop_twice_releases_buffers_once() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        pump.init(source(Duration::from_secs(1))).unwrap();
        pump.fill(4).unwrap();

        pump.stop().unwrap();
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(pump.voice_state().unwrap(), VoiceState::Stopped);

        pump.stop().unwrap();
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_voice_count(), 1);

        drop(pump);
        assert_eq!(backend.live_voice_count(), 0);
    }

    #[test]
    fn stop_requires_voice() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        assert!(matches!(
            pump.stop(),
            Err(VoxStreamError::NotInitialized(_))
        ));
    }

    #[test]
    fn volume_pan_is_clamped_before_reaching_voice() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        pump.init(source(Duration::from_secs(1))).unwrap();
        let voice = pump.voice().unwrap();

        pump.set_volume_pan(VolumePan::new(-50000, 99999)).unwrap();
        assert_eq!(backend.voice_gain(voice), Some(0.0));
        assert_eq!(backend.voice_position(voice), Some(Vec3::new(20.0, 0.0, -1.0)));

        pump.set_volume_pan(VolumePan::new(-2500, -5000)).unwrap();
        assert_eq!(backend.voice_gain(voice), Some(0.75));
        assert_eq!(backend.voice_position(voice), Some(Vec3::new(-10.0, 0.0, -1.0)));
    }

    #[test]
    fn volume_pan_failure_keeps_state() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        pump.init(source(Duration::from_secs(1))).unwrap();
        pump.fill(4).unwrap();

        backend.inject_failure("set_position", ErrorCode::InvalidValue);
        assert!(pump.set_volume_pan(VolumePan::default()).is_err());
        assert_eq!(pump.state(), PumpState::Streaming);
    }

    #[test]
    fn loop_and_fade_requests_are_inert() {
        let (backend, _device) = setup();
        let mut pump = pump(&backend);
        pump.init(source(Duration::from_millis(100))).unwrap();
        pump.set_looping(10);
        pump.begin_fade_out(441);
        assert!(pump.is_looping());
        assert_eq!(pump.loop_start_frame(), 10);
        assert_eq!(pump.fade_frames(), 441);

        assert_eq!(pump.fill(4).unwrap(), FillStatus::Exhausted);
        assert_eq!(pump.fade_frames_played(), 0);
    }
}
