//! Stream session: serial allocation and cooperative pumping.

use crate::backend::{Backend, VoiceState};
use crate::config::StreamerDesc;
use crate::device::DeviceManager;
use crate::error::{Result, VoxStreamError};
use crate::events::StreamEvent;
use crate::math::{VolumePan, gain_to_master_volume, master_volume_to_gain};
use crate::pump::{FillStatus, StreamPump};
use crate::source::{AudioSource, DecodedFileSource};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Serial number handed out by [`StreamSession::play`].
///
/// Serials start at 1 and increase with every successful `play`; a stopped
/// stream's serial is never handed out again.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    pub fn get(&self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owns every active stream and drives them from the host loop.
///
/// Single-threaded by design: the host calls [`tick`](Self::tick) once per
/// frame and that is the only thing that moves data into the voices. A stream
/// that is not ticked runs out of queued audio and falls silent.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use voxstream::backend::SoftwareBackend;
/// use voxstream::source::PcmSource;
/// use voxstream::{DeviceManager, StreamSession, StreamerDesc, VolumePan};
///
/// let backend = Arc::new(SoftwareBackend::new(Default::default()));
/// let mut session = StreamSession::new(DeviceManager::new(backend, StreamerDesc::default()));
/// session.init()?;
///
/// let tone = PcmSource::sine(440.0, std::time::Duration::from_secs(2), 44100, 2)?;
/// let id = session.play(tone, VolumePan::centered(0))?;
/// while session.is_playing(id) {
///     session.tick();
///     std::thread::sleep(std::time::Duration::from_millis(16));
/// }
/// # Ok::<(), voxstream::VoxStreamError>(())
/// ```
pub struct StreamSession<B: Backend> {
    desc: StreamerDesc,
    streams: BTreeMap<StreamId, StreamPump<B>>,
    device: DeviceManager<B>,
    last_serial: u32,
    event_sender: Sender<StreamEvent>,
    event_receiver: Receiver<StreamEvent>,
}

impl<B: Backend> StreamSession<B> {
    pub fn new(device: DeviceManager<B>) -> Self {
        let (event_sender, event_receiver) =
            crossbeam_channel::bounded(device.desc().event_capacity.max(1));
        Self {
            desc: device.desc().clone(),
            streams: BTreeMap::new(),
            device,
            last_serial: 0,
            event_sender,
            event_receiver,
        }
    }

    /// Shorthand for a session over a fresh, uninitialized device manager.
    pub fn with_backend(backend: Arc<B>, desc: StreamerDesc) -> Self {
        Self::new(DeviceManager::new(backend, desc))
    }

    /// Initialize the device if it is not already.
    pub fn init(&mut self) -> Result<()> {
        if self.device.is_initialized() {
            return Ok(());
        }
        self.device.init()
    }

    /// Stop every stream, then release the device.
    pub fn deinit(&mut self) {
        self.stop_all();
        self.device.deinit();
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_initialized()
    }

    pub fn device(&self) -> &DeviceManager<B> {
        &self.device
    }

    fn require_init(&self) -> Result<()> {
        if self.device.is_initialized() {
            Ok(())
        } else {
            Err(VoxStreamError::NotInitialized("stream session"))
        }
    }

    /// Start streaming `source` and return its serial.
    ///
    /// The first `initial_buffer_count` buffers are filled before returning. On
    /// failure the source is dropped and no serial is consumed.
    pub fn play<S: AudioSource + 'static>(
        &mut self,
        source: S,
        volume_pan: VolumePan,
    ) -> Result<StreamId> {
        self.play_boxed(Box::new(source), volume_pan)
    }

    pub fn play_boxed(
        &mut self,
        source: Box<dyn AudioSource>,
        volume_pan: VolumePan,
    ) -> Result<StreamId> {
        self.require_init()?;

        let mut pump = StreamPump::new(self.device.backend().clone(), self.desc.clone());
        pump.init(source)?;
        pump.set_volume_pan(volume_pan)?;

        let status = pump.fill(self.desc.initial_buffer_count.max(1))?;
        if status == FillStatus::Exhausted && pump.voice_state()? != VoiceState::Playing {
            return Err(VoxStreamError::SourceOpenFailed(
                "source produced no audio".into(),
            ));
        }

        let id = self.next_serial();
        log::info!(
            "Stream {} started (volume {}, pan {})",
            id,
            volume_pan.volume,
            volume_pan.pan
        );
        self.streams.insert(id, pump);
        emit(&self.event_sender, StreamEvent::StreamStarted { stream_id: id });
        Ok(id)
    }

    /// Decode and stream a sound file.
    pub fn play_file(&mut self, path: impl AsRef<Path>, volume_pan: VolumePan) -> Result<StreamId> {
        self.require_init()?;
        log::debug!("play_file({})", path.as_ref().display());
        let source = DecodedFileSource::open(path)?;
        self.play(source, volume_pan)
    }

    fn next_serial(&mut self) -> StreamId {
        loop {
            self.last_serial = self.last_serial.wrapping_add(1);
            if self.last_serial == 0 {
                log::warn!("Stream serial counter wrapped");
                continue;
            }
            let id = StreamId::from_raw(self.last_serial);
            if !self.streams.contains_key(&id) {
                return id;
            }
        }
    }

    /// Stop a stream immediately. Returns whether `id` was live.
    pub fn stop(&mut self, id: StreamId) -> bool {
        let Some(mut pump) = self.streams.remove(&id) else {
            log::debug!("stop({}): not playing", id);
            return false;
        };

        if let Err(e) = pump.stop() {
            log::error!("Error while stopping stream {}: {}", id, e);
        }
        drop(pump);

        log::info!("Stream {} stopped", id);
        emit(&self.event_sender, StreamEvent::StreamStopped { stream_id: id });
        true
    }

    pub fn stop_all(&mut self) {
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            self.stop(id);
        }
    }

    /// True while `id` is in the session, including while its last buffers drain.
    pub fn is_playing(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// Apply volume/pan to a live stream; unknown ids are ignored.
    pub fn set_volume_pan(&mut self, id: StreamId, volume_pan: VolumePan) -> Result<()> {
        match self.streams.get_mut(&id) {
            Some(pump) => pump.set_volume_pan(volume_pan),
            None => Ok(()),
        }
    }

    /// Request looping from `loop_start_frame`. Recorded only; playback is unchanged.
    pub fn set_looping(&mut self, id: StreamId, loop_start_frame: u64) -> bool {
        match self.streams.get_mut(&id) {
            Some(pump) => {
                pump.set_looping(loop_start_frame);
                true
            }
            None => false,
        }
    }

    /// Request a fade-out. Recorded only; playback is unchanged.
    pub fn fade_out(&mut self, id: StreamId, duration: Duration) -> bool {
        match self.streams.get_mut(&id) {
            Some(pump) => {
                let rate = pump.frame_rate().unwrap_or(0) as f64;
                pump.begin_fade_out((duration.as_secs_f64() * rate) as u64);
                true
            }
            None => false,
        }
    }

    /// Pump every stream once and drop the ones that have finished.
    ///
    /// A stream is removed when its source is exhausted and its voice has
    /// stopped playing, or when pumping it hit a backend error. Other streams
    /// are unaffected either way.
    pub fn tick(&mut self) {
        let sender = &self.event_sender;

        self.streams.retain(|&id, pump| {
            let event = match pump.fill(0) {
                Ok(FillStatus::Streaming) => return true,
                Ok(FillStatus::Exhausted) => match pump.voice_state() {
                    Ok(VoiceState::Playing) => return true,
                    Ok(_) => {
                        log::info!("Stream {} finished", id);
                        StreamEvent::StreamCompleted { stream_id: id }
                    }
                    Err(e) => {
                        log::error!("Stream {} lost its voice: {}", id, e);
                        StreamEvent::StreamFailed {
                            stream_id: id,
                            error: e.to_string(),
                        }
                    }
                },
                Err(e) => {
                    log::error!("Stream {} terminated: {}", id, e);
                    StreamEvent::StreamFailed {
                        stream_id: id,
                        error: e.to_string(),
                    }
                }
            };
            emit(sender, event);
            false
        });
    }

    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    pub fn active_streams(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Voices not taken by a live stream; 0 while uninitialized.
    pub fn free_voice_count(&self) -> usize {
        if !self.device.is_initialized() {
            return 0;
        }
        self.device.max_voices().saturating_sub(self.streams.len())
    }

    /// Set master volume in `[0, 100]`; out-of-range values are clamped.
    pub fn set_global_volume(&mut self, volume: i32) -> Result<()> {
        self.require_init()?;
        self.device
            .backend()
            .set_listener_gain(master_volume_to_gain(volume))?;
        Ok(())
    }

    pub fn global_volume(&self) -> Result<u32> {
        self.require_init()?;
        let gain = self.device.backend().listener_gain()?;
        Ok(gain_to_master_volume(gain))
    }

    /// Drain pending stream events.
    ///
    /// At most `event_capacity` events are held; later ones are dropped until
    /// the host polls again.
    pub fn poll_events(&self) -> Vec<StreamEvent> {
        self.event_receiver.try_iter().collect()
    }
}

fn emit(sender: &Sender<StreamEvent>, event: StreamEvent) {
    if let Err(TrySendError::Full(event)) = sender.try_send(event) {
        log::debug!("Event queue full, dropping {:?}", event);
    }
}

impl<B: Backend> Drop for StreamSession<B> {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ErrorCode, SoftwareBackend};
    use crate::config::SoftwareBackendDesc;
    use crate::source::PcmSource;

    fn session_with(max_voices: usize) -> (Arc<SoftwareBackend>, StreamSession<SoftwareBackend>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(SoftwareBackend::new(
            SoftwareBackendDesc::default()
                .output_sample_rate(44100)
                .max_voices(Some(max_voices)),
        ));
        let mut session = StreamSession::with_backend(backend.clone(), StreamerDesc::default());
        session.init().unwrap();
        (backend, session)
    }

    fn tone() -> PcmSource {
        PcmSource::sine(440.0, Duration::from_secs(1), 44100, 2).unwrap()
    }

    #[test]
    fn serials_increase_and_are_never_reused() {
        let (_backend, mut session) = session_with(8);
        let a = session.play(tone(), VolumePan::default()).unwrap();
        let b = session.play(tone(), VolumePan::default()).unwrap();
        assert_eq!((a.get(), b.get()), (1, 2));

        assert!(session.stop(b));
        let c = session.play(tone(), VolumePan::default()).unwrap();
        assert_eq!(c.get(), 3);

        assert!(session.stop(a));
        assert!(session.stop(c));
        let d = session.play(tone(), VolumePan::default()).unwrap();
        assert_eq!(d.get(), 4);
    }

    #[test]
    fn serial_counter_wraps_past_zero() {
        let (_backend, mut session) = session_with(8);
        session.last_serial = u32::MAX - 1;
        assert_eq!(session.play(tone(), VolumePan::default()).unwrap().get(), u32::MAX);
        assert_eq!(session.play(tone(), VolumePan::default()).unwrap().get(), 1);
    }

    #[test]
    fn play_requires_initialized_device() {
        let backend = Arc::new(SoftwareBackend::new(SoftwareBackendDesc::default()));
        let mut session = StreamSession::with_backend(backend, StreamerDesc::default());
        assert!(matches!(
            session.play(tone(), VolumePan::default()),
            Err(VoxStreamError::NotInitialized(_))
        ));
        assert_eq!(session.free_voice_count(), 0);
        assert!(session.global_volume().is_err());
    }

    #[test]
    fn failed_play_consumes_no_serial_and_leaks_nothing() {
        let (backend, mut session) = session_with(8);
        backend.inject_failure_after("buffer_data", ErrorCode::OutOfMemory, 1);

        let result = session.play(tone(), VolumePan::default());
        assert!(matches!(result, Err(VoxStreamError::BackendCallFailed(_))));
        assert_eq!(backend.live_voice_count(), 0);
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(session.active_count(), 0);

        let id = session.play(tone(), VolumePan::default()).unwrap();
        assert_eq!(id.get(), 1);
    }

    #[test]
    fn empty_source_fails_to_play() {
        let (backend, mut session) = session_with(8);
        let empty = PcmSource::new(Vec::new(), 44100, 2, 2).unwrap();
        assert!(matches!(
            session.play(empty, VolumePan::default()),
            Err(VoxStreamError::SourceOpenFailed(_))
        ));
        assert_eq!(backend.live_voice_count(), 0);
    }

    #[test]
    fn short_source_plays_and_drains() {
        let (backend, mut session) = session_with(8);
        let short = PcmSource::silence(Duration::from_millis(80), 44100, 1).unwrap();
        let id = session.play(short, VolumePan::default()).unwrap();
        assert!(session.is_playing(id));

        session.tick();
        assert!(session.is_playing(id));

        backend.advance(Duration::from_millis(100));
        session.tick();
        assert!(!session.is_playing(id));
    }

    #[test]
    fn free_voices_track_active_streams() {
        let (_backend, mut session) = session_with(3);
        assert_eq!(session.free_voice_count(), 3);

        let ids: Vec<_> = (0..3)
            .map(|_| session.play(tone(), VolumePan::default()).unwrap())
            .collect();
        assert_eq!(session.free_voice_count(), 0);

        let overflow = session.play(tone(), VolumePan::default());
        assert!(matches!(overflow, Err(VoxStreamError::VoiceAllocationFailed(_))));
        assert_eq!(session.free_voice_count(), 0);

        session.stop(ids[1]);
        assert_eq!(session.free_voice_count(), 1);
    }

    #[test]
    fn stop_reports_whether_stream_was_live() {
        let (backend, mut session) = session_with(8);
        let id = session.play(tone(), VolumePan::default()).unwrap();

        assert!(session.stop(id));
        assert!(!session.is_playing(id));
        assert_eq!(backend.live_voice_count(), 0);
        assert_eq!(backend.live_buffer_count(), 0);

        assert!(!session.stop(id));
        assert!(!session.stop(StreamId(99)));
    }

    #[test]
    fn volume_pan_for_unknown_stream_is_ignored() {
        let (backend, mut session) = session_with(8);
        session
            .set_volume_pan(StreamId(7), VolumePan::new(-100, 100))
            .unwrap();
        assert_eq!(backend.live_voice_count(), 0);
    }

    #[test]
    fn global_volume_is_clamped() {
        let (_backend, mut session) = session_with(8);
        session.set_global_volume(250).unwrap();
        assert_eq!(session.global_volume().unwrap(), 100);
        session.set_global_volume(-20).unwrap();
        assert_eq!(session.global_volume().unwrap(), 0);
        session.set_global_volume(42).unwrap();
        assert_eq!(session.global_volume().unwrap(), 42);
    }

    #[test]
    fn loop_and_fade_requests_need_live_stream() {
        let (_backend, mut session) = session_with(8);
        let id = session.play(tone(), VolumePan::default()).unwrap();
        assert!(session.set_looping(id, 0));
        assert!(session.fade_out(id, Duration::from_millis(500)));
        assert!(!session.fade_out(StreamId(42), Duration::from_millis(500)));
        assert!(!session.set_looping(StreamId(42), 0));
    }

    #[test]
    fn events_follow_stream_lifecycle() {
        let (_backend, mut session) = session_with(8);
        let id = session.play(tone(), VolumePan::default()).unwrap();
        session.stop(id);

        let events = session.poll_events();
        assert_eq!(
            events,
            vec![
                StreamEvent::StreamStarted { stream_id: id },
                StreamEvent::StreamStopped { stream_id: id },
            ]
        );
        assert!(session.poll_events().is_empty());
    }

    #[test]
    fn deinit_stops_streams_and_closes_device() {
        let (backend, mut session) = session_with(8);
        session.play(tone(), VolumePan::default()).unwrap();
        session.play(tone(), VolumePan::default()).unwrap();

        session.deinit();
        assert_eq!(session.active_count(), 0);
        assert!(!backend.is_device_open());
        assert_eq!(backend.live_voice_count(), 0);
    }

    #[test]
    fn zero_initial_buffers_still_starts_voice() {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(SoftwareBackend::new(
            SoftwareBackendDesc::default().output_sample_rate(44100),
        ));
        let mut desc = StreamerDesc::default();
        desc.initial_buffer_count = 0;
        let mut session = StreamSession::with_backend(backend.clone(), desc);
        session.init().unwrap();

        let short = PcmSource::silence(Duration::from_millis(80), 44100, 1).unwrap();
        let id = session.play(short, VolumePan::default()).unwrap();
        assert_eq!(backend.live_buffer_count(), 1);

        let mut ticks = 0;
        while session.is_playing(id) {
            assert!(ticks < 10, "stream never finished");
            backend.advance(Duration::from_millis(50));
            session.tick();
            ticks += 1;
        }
        assert_eq!(backend.live_voice_count(), 0);
    }

    #[test]
    fn unpolled_events_are_capped() {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(SoftwareBackend::new(SoftwareBackendDesc::default()));
        let mut session = StreamSession::with_backend(
            backend,
            StreamerDesc::default().event_capacity(4),
        );
        session.init().unwrap();

        for _ in 0..5 {
            let id = session.play(tone(), VolumePan::default()).unwrap();
            session.stop(id);
        }

        let events = session.poll_events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], StreamEvent::StreamStarted { stream_id: StreamId(1) });

        // room again after polling
        let id = session.play(tone(), VolumePan::default()).unwrap();
        assert_eq!(
            session.poll_events(),
            vec![StreamEvent::StreamStarted { stream_id: id }]
        );
    }

    #[test]
    fn stream_id_displays_as_number() {
        assert_eq!(StreamId(12).to_string(), "12");
    }
}
