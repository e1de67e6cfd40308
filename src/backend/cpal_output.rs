use super::SoftwareBackend;
use crate::error::{Result, VoxStreamError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Plays a [`SoftwareBackend`] through the default cpal output device.
///
/// The device callback pulls mixed frames from the backend; everything else
/// (pumping, queueing) stays on the thread that owns the session.
pub struct CpalOutput {
    stream: Option<cpal::Stream>,
    frames_rendered: Arc<AtomicUsize>,
}

impl CpalOutput {
    pub fn start(backend: &SoftwareBackend) -> Result<Self> {
        let desc = backend.desc();

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            VoxStreamError::BackendUnavailable("No default output device available".into())
        })?;

        let default_config = device.default_output_config().map_err(|e| {
            VoxStreamError::BackendUnavailable(format!("Failed to get default config: {}", e))
        })?;

        let config = cpal::StreamConfig {
            channels: desc.output_channels,
            sample_rate: cpal::SampleRate(desc.output_sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        log::info!(
            "Opening output device {} at {} Hz, {} channels ({:?})",
            device.name().unwrap_or_else(|_| "<unnamed>".to_string()),
            config.sample_rate.0,
            config.channels,
            default_config.sample_format()
        );

        let frames_rendered = Arc::new(AtomicUsize::new(0));
        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &config, backend.clone(), frames_rendered.clone())?
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, backend.clone(), frames_rendered.clone())?
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &config, backend.clone(), frames_rendered.clone())?
            }
            other => {
                return Err(VoxStreamError::BackendUnavailable(format!(
                    "Unsupported sample format {:?}",
                    other
                )));
            }
        };

        stream.play().map_err(|e| {
            VoxStreamError::BackendUnavailable(format!("Failed to start stream: {}", e))
        })?;

        Ok(Self {
            stream: Some(stream),
            frames_rendered,
        })
    }

    pub fn frames_rendered(&self) -> usize {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("Output stream stopped");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    backend: SoftwareBackend,
    frames_rendered: Arc<AtomicUsize>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut mix_buffer: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mix_buffer.resize(data.len(), 0.0);
                let frames = backend.render(&mut mix_buffer);
                for (out, &sample) in data.iter_mut().zip(mix_buffer.iter()) {
                    *out = T::from_sample(sample.clamp(-1.0, 1.0));
                }
                frames_rendered.fetch_add(frames, Ordering::Relaxed);
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| VoxStreamError::BackendUnavailable(format!("Failed to build stream: {}", e)))
}
