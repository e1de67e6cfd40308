//! In-process OpenAL-like backend.
//!
//! Voices own FIFO queues of uploaded PCM buffers. Time only moves when
//! [`SoftwareBackend::render`] (usually from a [`CpalOutput`](super::CpalOutput)
//! callback) or [`SoftwareBackend::advance`] is called; each queued buffer is
//! consumed at its own frame rate, fully consumed buffers become "processed",
//! and a voice whose queue runs dry stops by itself.

use super::{
    Backend, BackendError, BackendResult, BufferId, ContextHandle, DeviceAttribute, DeviceHandle,
    ErrorCode, SampleFormat, VoiceId, VoiceState,
};
use crate::config::SoftwareBackendDesc;
use crate::math::{PAN_SPAN, Vec3};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const ALC_INVALID_DEVICE: u32 = 0xA001;
const ALC_INVALID_CONTEXT: u32 = 0xA002;

/// Cloneable handle to a software voice table.
#[derive(Clone)]
pub struct SoftwareBackend {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    desc: SoftwareBackendDesc,
    next_handle: u32,
    device: Option<DeviceHandle>,
    contexts: HashSet<ContextHandle>,
    current: Option<ContextHandle>,
    voices: HashMap<VoiceId, Voice>,
    buffers: HashMap<BufferId, PcmBuffer>,
    listener_gain: f32,
    faults: Vec<Fault>,
}

struct Voice {
    queue: VecDeque<BufferId>,
    /// Leading queue entries that have been fully played
    processed: usize,
    /// Fractional frame position inside `queue[processed]`
    cursor: f64,
    state: VoiceState,
    gain: f32,
    position: Vec3,
}

struct PcmBuffer {
    frame_rate: u32,
    channels: usize,
    /// Interleaved, normalized to [-1, 1]
    samples: Vec<f32>,
    queued_on: Option<VoiceId>,
}

impl PcmBuffer {
    fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

struct Fault {
    op: &'static str,
    code: ErrorCode,
    remaining_ok: usize,
}

impl SoftwareBackend {
    pub fn new(desc: SoftwareBackendDesc) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                desc,
                next_handle: 1,
                device: None,
                contexts: HashSet::new(),
                current: None,
                voices: HashMap::new(),
                buffers: HashMap::new(),
                listener_gain: 1.0,
                faults: Vec::new(),
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn desc(&self) -> SoftwareBackendDesc {
        self.inner().desc.clone()
    }

    /// Make the next call to `op` fail with `code`.
    pub fn inject_failure(&self, op: &'static str, code: ErrorCode) {
        self.inject_failure_after(op, code, 0);
    }

    /// Let `successes` calls to `op` through, then fail the following one with `code`.
    pub fn inject_failure_after(&self, op: &'static str, code: ErrorCode, successes: usize) {
        self.inner().faults.push(Fault {
            op,
            code,
            remaining_ok: successes,
        });
    }

    pub fn clear_failures(&self) {
        self.inner().faults.clear();
    }

    pub fn live_voice_count(&self) -> usize {
        self.inner().voices.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.inner().buffers.len()
    }

    pub fn is_device_open(&self) -> bool {
        self.inner().device.is_some()
    }

    pub fn context_count(&self) -> usize {
        self.inner().contexts.len()
    }

    pub fn voice_gain(&self, voice: VoiceId) -> Option<f32> {
        self.inner().voices.get(&voice).map(|v| v.gain)
    }

    pub fn voice_position(&self, voice: VoiceId) -> Option<Vec3> {
        self.inner().voices.get(&voice).map(|v| v.position)
    }

    /// Consume `duration` of output time on every playing voice without producing audio.
    pub fn advance(&self, duration: Duration) {
        let mut inner = self.inner();
        let frames =
            (duration.as_secs_f64() * inner.desc.output_sample_rate as f64).round() as usize;
        inner.mix(frames, None);
    }

    /// Mix every playing voice into `out` (interleaved at the configured output
    /// channel count) and return the number of frames written.
    pub fn render(&self, out: &mut [f32]) -> usize {
        out.iter_mut().for_each(|s| *s = 0.0);
        let mut inner = self.inner();
        let channels = inner.desc.output_channels.max(1) as usize;
        let frames = out.len() / channels;
        inner.mix(frames, Some(out));
        frames
    }
}

impl Inner {
    fn check_fault(&mut self, op: &'static str) -> BackendResult<()> {
        let Some(index) = self.faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        if self.faults[index].remaining_ok > 0 {
            self.faults[index].remaining_ok -= 1;
            return Ok(());
        }
        let fault = self.faults.remove(index);
        Err(BackendError::new(op, fault.code))
    }

    fn next_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn require_context(&self, op: &'static str) -> BackendResult<()> {
        match self.current {
            Some(_) => Ok(()),
            None => Err(BackendError::new(op, ErrorCode::InvalidOperation)),
        }
    }

    fn voice_mut(&mut self, op: &'static str, voice: VoiceId) -> BackendResult<&mut Voice> {
        self.require_context(op)?;
        self.voices
            .get_mut(&voice)
            .ok_or(BackendError::new(op, ErrorCode::InvalidName))
    }

    fn enter(&mut self, op: &'static str) -> BackendResult<()> {
        self.check_fault(op)?;
        self.require_context(op)
    }

    fn mix(&mut self, frames: usize, mut out: Option<&mut [f32]>) {
        let out_rate = self.desc.output_sample_rate.max(1) as f64;
        let out_channels = self.desc.output_channels.max(1) as usize;
        let master = self.listener_gain;
        let Inner {
            voices, buffers, ..
        } = self;

        for voice in voices.values_mut() {
            if voice.state != VoiceState::Playing {
                continue;
            }

            let gain = voice.gain * master;
            let balance = (voice.position.x / PAN_SPAN).clamp(-1.0, 1.0);
            let left_gain = gain * (1.0 - balance).min(1.0);
            let right_gain = gain * (1.0 + balance).min(1.0);

            let mut frame = 0;
            while frame < frames {
                let Some(buffer) = voice
                    .queue
                    .get(voice.processed)
                    .and_then(|id| buffers.get(id))
                else {
                    voice.state = VoiceState::Stopped;
                    voice.cursor = 0.0;
                    break;
                };

                let buffer_frames = buffer.frames();
                let index = voice.cursor as usize;
                if index >= buffer_frames {
                    voice.processed += 1;
                    voice.cursor = (voice.cursor - buffer_frames as f64).max(0.0);
                    continue;
                }

                if let Some(out) = out.as_deref_mut() {
                    let base = index * buffer.channels;
                    let (left, right) = if buffer.channels == 1 {
                        (buffer.samples[base], buffer.samples[base])
                    } else {
                        (buffer.samples[base], buffer.samples[base + 1])
                    };
                    let slot = &mut out[frame * out_channels..(frame + 1) * out_channels];
                    if out_channels == 1 {
                        slot[0] += (left * left_gain + right * right_gain) * 0.5;
                    } else {
                        slot[0] += left * left_gain;
                        slot[1] += right * right_gain;
                    }
                }

                voice.cursor += buffer.frame_rate as f64 / out_rate;
                frame += 1;
            }
        }
    }
}

fn decode_pcm(format: SampleFormat, data: &[u8]) -> Vec<f32> {
    match format.sample_size() {
        1 => data.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        _ => data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect(),
    }
}

impl Backend for SoftwareBackend {
    fn open_device(&self) -> BackendResult<DeviceHandle> {
        let mut inner = self.inner();
        inner.check_fault("open_device")?;
        if inner.device.is_some() {
            return Err(BackendError::new(
                "open_device",
                ErrorCode::Device(ALC_INVALID_DEVICE),
            ));
        }
        let device = DeviceHandle(inner.next_handle());
        inner.device = Some(device);
        log::debug!("Software device {:?} opened", device);
        Ok(device)
    }

    fn close_device(&self, device: DeviceHandle) {
        let mut inner = self.inner();
        if inner.device != Some(device) {
            return;
        }
        inner.device = None;
        inner.contexts.clear();
        inner.current = None;
        inner.voices.clear();
        inner.buffers.clear();
        log::debug!("Software device {:?} closed", device);
    }

    fn create_context(&self, device: DeviceHandle) -> BackendResult<ContextHandle> {
        let mut inner = self.inner();
        inner.check_fault("create_context")?;
        if inner.device != Some(device) {
            return Err(BackendError::new(
                "create_context",
                ErrorCode::Device(ALC_INVALID_DEVICE),
            ));
        }
        let context = ContextHandle(inner.next_handle());
        inner.contexts.insert(context);
        Ok(context)
    }

    fn make_context_current(&self, context: Option<ContextHandle>) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.check_fault("make_context_current")?;
        if let Some(context) = context {
            if !inner.contexts.contains(&context) {
                return Err(BackendError::new(
                    "make_context_current",
                    ErrorCode::Device(ALC_INVALID_CONTEXT),
                ));
            }
        }
        inner.current = context;
        Ok(())
    }

    fn destroy_context(&self, context: ContextHandle) {
        let mut inner = self.inner();
        if !inner.contexts.remove(&context) {
            return;
        }
        if inner.current == Some(context) {
            inner.current = None;
        }
        inner.voices.clear();
        for buffer in inner.buffers.values_mut() {
            buffer.queued_on = None;
        }
    }

    fn device_attributes(&self, device: DeviceHandle) -> BackendResult<Vec<DeviceAttribute>> {
        let mut inner = self.inner();
        inner.check_fault("device_attributes")?;
        if inner.device != Some(device) {
            return Err(BackendError::new(
                "device_attributes",
                ErrorCode::Device(ALC_INVALID_DEVICE),
            ));
        }
        let mut attributes = vec![DeviceAttribute::Frequency(inner.desc.output_sample_rate)];
        if let Some(max) = inner.desc.max_voices {
            attributes.push(DeviceAttribute::MonoVoices(max as u32));
            attributes.push(DeviceAttribute::StereoVoices((max / 2) as u32));
        }
        Ok(attributes)
    }

    fn create_voice(&self) -> BackendResult<VoiceId> {
        let mut inner = self.inner();
        inner.enter("create_voice")?;
        if let Some(max) = inner.desc.max_voices {
            if inner.voices.len() >= max {
                return Err(BackendError::new("create_voice", ErrorCode::OutOfMemory));
            }
        }
        let voice = VoiceId(inner.next_handle());
        inner.voices.insert(
            voice,
            Voice {
                queue: VecDeque::new(),
                processed: 0,
                cursor: 0.0,
                state: VoiceState::Initial,
                gain: 1.0,
                position: Vec3::ZERO,
            },
        );
        Ok(voice)
    }

    fn delete_voice(&self, voice: VoiceId) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.enter("delete_voice")?;
        let removed = inner
            .voices
            .remove(&voice)
            .ok_or(BackendError::new("delete_voice", ErrorCode::InvalidName))?;
        for id in removed.queue {
            if let Some(buffer) = inner.buffers.get_mut(&id) {
                buffer.queued_on = None;
            }
        }
        Ok(())
    }

    fn create_buffer(&self) -> BackendResult<BufferId> {
        let mut inner = self.inner();
        inner.enter("create_buffer")?;
        let buffer = BufferId(inner.next_handle());
        inner.buffers.insert(
            buffer,
            PcmBuffer {
                frame_rate: 0,
                channels: 1,
                samples: Vec::new(),
                queued_on: None,
            },
        );
        Ok(buffer)
    }

    fn delete_buffer(&self, buffer: BufferId) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.enter("delete_buffer")?;
        match inner.buffers.get(&buffer) {
            None => Err(BackendError::new("delete_buffer", ErrorCode::InvalidName)),
            Some(b) if b.queued_on.is_some() => Err(BackendError::new(
                "delete_buffer",
                ErrorCode::InvalidOperation,
            )),
            Some(_) => {
                inner.buffers.remove(&buffer);
                Ok(())
            }
        }
    }

    fn buffer_data(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        data: &[u8],
        frame_rate: u32,
    ) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.enter("buffer_data")?;
        if frame_rate == 0 || data.len() % format.frame_size() != 0 {
            return Err(BackendError::new("buffer_data", ErrorCode::InvalidValue));
        }
        let target = inner
            .buffers
            .get_mut(&buffer)
            .ok_or(BackendError::new("buffer_data", ErrorCode::InvalidName))?;
        if target.queued_on.is_some() {
            return Err(BackendError::new("buffer_data", ErrorCode::InvalidOperation));
        }
        target.frame_rate = frame_rate;
        target.channels = format.channels();
        target.samples = decode_pcm(format, data);
        Ok(())
    }

    fn queue_buffer(&self, voice: VoiceId, buffer: BufferId) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.enter("queue_buffer")?;
        if !inner.voices.contains_key(&voice) {
            return Err(BackendError::new("queue_buffer", ErrorCode::InvalidName));
        }
        let target = inner
            .buffers
            .get_mut(&buffer)
            .ok_or(BackendError::new("queue_buffer", ErrorCode::InvalidName))?;
        if target.queued_on.is_some() {
            return Err(BackendError::new("queue_buffer", ErrorCode::InvalidOperation));
        }
        target.queued_on = Some(voice);
        inner.voice_mut("queue_buffer", voice)?.queue.push_back(buffer);
        Ok(())
    }

    fn unqueue_buffer(&self, voice: VoiceId) -> BackendResult<BufferId> {
        let mut inner = self.inner();
        inner.check_fault("unqueue_buffer")?;
        let v = inner.voice_mut("unqueue_buffer", voice)?;
        if v.processed == 0 {
            return Err(BackendError::new("unqueue_buffer", ErrorCode::InvalidValue));
        }
        let buffer = v
            .queue
            .pop_front()
            .ok_or(BackendError::new("unqueue_buffer", ErrorCode::InvalidValue))?;
        v.processed -= 1;
        if let Some(b) = inner.buffers.get_mut(&buffer) {
            b.queued_on = None;
        }
        Ok(buffer)
    }

    fn processed_buffers(&self, voice: VoiceId) -> BackendResult<usize> {
        let mut inner = self.inner();
        inner.check_fault("processed_buffers")?;
        Ok(inner.voice_mut("processed_buffers", voice)?.processed)
    }

    fn queued_buffers(&self, voice: VoiceId) -> BackendResult<usize> {
        let mut inner = self.inner();
        inner.check_fault("queued_buffers")?;
        Ok(inner.voice_mut("queued_buffers", voice)?.queue.len())
    }

    fn play(&self, voice: VoiceId) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.check_fault("play")?;
        let v = inner.voice_mut("play", voice)?;
        if v.state == VoiceState::Playing {
            return Ok(());
        }
        v.processed = 0;
        v.cursor = 0.0;
        v.state = if v.queue.is_empty() {
            VoiceState::Stopped
        } else {
            VoiceState::Playing
        };
        Ok(())
    }

    fn stop(&self, voice: VoiceId) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.check_fault("stop")?;
        let v = inner.voice_mut("stop", voice)?;
        v.state = VoiceState::Stopped;
        v.processed = v.queue.len();
        v.cursor = 0.0;
        Ok(())
    }

    fn voice_state(&self, voice: VoiceId) -> BackendResult<VoiceState> {
        let mut inner = self.inner();
        inner.check_fault("voice_state")?;
        Ok(inner.voice_mut("voice_state", voice)?.state)
    }

    fn set_gain(&self, voice: VoiceId, gain: f32) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.check_fault("set_gain")?;
        if !(0.0..=1.0).contains(&gain) {
            return Err(BackendError::new("set_gain", ErrorCode::InvalidValue));
        }
        inner.voice_mut("set_gain", voice)?.gain = gain;
        Ok(())
    }

    fn set_position(&self, voice: VoiceId, position: Vec3) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.check_fault("set_position")?;
        if !position.is_finite() {
            return Err(BackendError::new("set_position", ErrorCode::InvalidValue));
        }
        inner.voice_mut("set_position", voice)?.position = position;
        Ok(())
    }

    fn set_listener_gain(&self, gain: f32) -> BackendResult<()> {
        let mut inner = self.inner();
        inner.enter("set_listener_gain")?;
        if !(0.0..=1.0).contains(&gain) {
            return Err(BackendError::new(
                "set_listener_gain",
                ErrorCode::InvalidValue,
            ));
        }
        inner.listener_gain = gain;
        Ok(())
    }

    fn listener_gain(&self) -> BackendResult<f32> {
        let mut inner = self.inner();
        inner.enter("listener_gain")?;
        Ok(inner.listener_gain)
    }
}
