use super::AudioSource;
use crate::error::{Result, VoxStreamError};
use std::time::Duration;

/// Raw PCM held in memory.
///
/// Useful for sounds that were already decoded elsewhere and for generated
/// audio. The bytes are consumed front to back exactly once.
#[derive(Debug, Clone)]
pub struct PcmSource {
    data: Vec<u8>,
    position: usize,
    frame_rate: u32,
    channels: u16,
    sample_size: u16,
}

impl PcmSource {
    pub fn new(data: Vec<u8>, frame_rate: u32, channels: u16, sample_size: u16) -> Result<Self> {
        if frame_rate == 0 {
            return Err(VoxStreamError::SourceOpenFailed(
                "frame rate must be positive".into(),
            ));
        }
        if !(1..=2).contains(&channels) || !(1..=2).contains(&sample_size) {
            return Err(VoxStreamError::SourceOpenFailed(format!(
                "unsupported layout: {} channels, {} byte samples",
                channels, sample_size
            )));
        }

        let frame_size = channels as usize * sample_size as usize;
        let mut data = data;
        data.truncate(data.len() - data.len() % frame_size);

        Ok(Self {
            data,
            position: 0,
            frame_rate,
            channels,
            sample_size,
        })
    }

    /// 16-bit source from interleaved samples
    pub fn from_i16(samples: &[i16], frame_rate: u32, channels: u16) -> Result<Self> {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(data, frame_rate, channels, 2)
    }

    /// 16-bit sine tone, identical on every channel
    pub fn sine(frequency: f32, duration: Duration, frame_rate: u32, channels: u16) -> Result<Self> {
        let frames = (duration.as_secs_f64() * frame_rate as f64).round() as usize;
        let samples: Vec<i16> = (0..frames)
            .flat_map(|i| {
                let t = i as f32 / frame_rate.max(1) as f32;
                let value = (t * frequency * 2.0 * std::f32::consts::PI).sin() * 0.5;
                std::iter::repeat((value * i16::MAX as f32) as i16).take(channels as usize)
            })
            .collect();
        Self::from_i16(&samples, frame_rate, channels)
    }

    /// 16-bit digital silence
    pub fn silence(duration: Duration, frame_rate: u32, channels: u16) -> Result<Self> {
        let frames = (duration.as_secs_f64() * frame_rate as f64).round() as usize;
        Self::new(vec![0; frames * channels as usize * 2], frame_rate, channels, 2)
    }

    pub fn total_frames(&self) -> usize {
        self.data.len() / self.frame_size()
    }

    pub fn remaining_frames(&self) -> usize {
        (self.data.len() - self.position) / self.frame_size()
    }
}

impl AudioSource for PcmSource {
    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn sample_size(&self) -> u16 {
        self.sample_size
    }

    fn read(&mut self, buffer: &mut [u8], max_frames: usize) -> std::io::Result<usize> {
        let frame_size = self.frame_size();
        let frames = max_frames
            .min(self.remaining_frames())
            .min(buffer.len() / frame_size);
        let bytes = frames * frame_size;
        buffer[..bytes].copy_from_slice(&self.data[self.position..self.position + bytes]);
        self.position += bytes;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_until_exhausted() {
        let mut source = PcmSource::from_i16(&[1, 2, 3, 4, 5, 6], 8000, 2).unwrap();
        assert_eq!(source.total_frames(), 3);

        let mut buffer = [0u8; 8];
        assert_eq!(source.read(&mut buffer, 2).unwrap(), 2);
        assert_eq!(&buffer[..4], &[1, 0, 2, 0]);
        assert_eq!(source.read(&mut buffer, 2).unwrap(), 1);
        assert_eq!(&buffer[..4], &[5, 0, 6, 0]);
        assert_eq!(source.read(&mut buffer, 2).unwrap(), 0);
    }

    #[test]
    fn partial_trailing_frame_is_dropped() {
        let source = PcmSource::new(vec![0; 7], 8000, 2, 2).unwrap();
        assert_eq!(source.total_frames(), 1);
    }

    #[test]
    fn rejects_unsupported_layouts() {
        assert!(matches!(
            PcmSource::new(vec![], 44100, 6, 2),
            Err(VoxStreamError::SourceOpenFailed(_))
        ));
        assert!(matches!(
            PcmSource::new(vec![], 0, 1, 1),
            Err(VoxStreamError::SourceOpenFailed(_))
        ));
    }

    #[test]
    fn generated_tone_has_expected_length() {
        let source = PcmSource::sine(440.0, Duration::from_secs(1), 44100, 2).unwrap();
        assert_eq!(source.total_frames(), 44100);
        assert_eq!(source.frame_size(), 4);
    }
}
