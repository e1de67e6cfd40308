use super::AudioSource;
use crate::error::{Result, VoxStreamError};
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{Decoder, DecoderOptions},
        errors::Error,
        formats::{FormatOptions, FormatReader},
        io::{MediaSource, MediaSourceStream},
        meta::MetadataOptions,
        probe::Hint,
    },
    default::{get_codecs, get_probe},
};

/// A sound file decoded packet by packet as the pump asks for data.
///
/// Any container/codec symphonia understands is accepted as long as it has one
/// or two channels. Output is always interleaved signed 16-bit PCM.
pub struct DecodedFileSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    frame_rate: u32,
    channels: u16,
    pending: Vec<u8>,
    pending_pos: usize,
    finished: bool,
}

impl DecodedFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            VoxStreamError::SourceOpenFailed(format!("{}: {}", path.display(), e))
        })?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let source = Self::from_reader(Box::new(file), hint)?;
        log::debug!("Streaming {}", path.display());
        Ok(source)
    }

    /// Stream encoded audio that is already in memory (a whole WAV file, say).
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_reader(Box::new(Cursor::new(data)), Hint::new())
    }

    /// Stream from any symphonia media source. `hint` may carry a file
    /// extension or mime type to speed up probing.
    pub fn from_reader(reader: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(reader, Default::default());

        let probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                VoxStreamError::SourceOpenFailed(format!("Failed to probe audio format: {:?}", e))
            })?;

        let format = probed.format;

        let track = format.default_track().ok_or_else(|| {
            VoxStreamError::SourceOpenFailed("No default audio track found".to_string())
        })?;

        let frame_rate = track.codec_params.sample_rate.ok_or_else(|| {
            VoxStreamError::SourceOpenFailed("Sample rate not found".to_string())
        })?;

        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| VoxStreamError::SourceOpenFailed("Channel count not found".to_string()))?
            .count() as u16;

        if frame_rate == 0 || !(1..=2).contains(&channels) {
            return Err(VoxStreamError::SourceOpenFailed(format!(
                "Unsupported layout: {} Hz, {} channels",
                frame_rate, channels
            )));
        }

        let decoder = get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| {
                VoxStreamError::SourceOpenFailed(format!("Failed to create decoder: {:?}", e))
            })?;
        let track_id = track.id;

        log::debug!(
            "Opened encoded stream: {} Hz, {} channels",
            frame_rate,
            channels
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            frame_rate,
            channels,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        })
    }

    /// Decode the next packet of our track into `pending`.
    /// Returns false once the stream has ended.
    fn decode_next(&mut self) -> std::io::Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(_)) | Err(Error::ResetRequired) => return Ok(false),
                Err(e) => {
                    return Err(std::io::Error::other(format!(
                        "Error reading packet: {:?}",
                        e
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(_)) => return Ok(false),
                Err(Error::DecodeError(e)) => {
                    log::warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(std::io::Error::other(format!(
                        "Error decoding packet: {:?}",
                        e
                    )));
                }
            };

            let spec = *decoded.spec();
            let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
            samples.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending_pos = 0;
            self.pending
                .extend(samples.samples().iter().flat_map(|s| s.to_le_bytes()));
            return Ok(true);
        }
    }
}

impl AudioSource for DecodedFileSource {
    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn sample_size(&self) -> u16 {
        2
    }

    fn read(&mut self, buffer: &mut [u8], max_frames: usize) -> std::io::Result<usize> {
        let frame_size = self.frame_size();
        let wanted = max_frames.min(buffer.len() / frame_size) * frame_size;
        let mut written = 0;

        while written < wanted {
            if self.pending_pos >= self.pending.len() {
                if self.finished || !self.decode_next()? {
                    self.finished = true;
                    break;
                }
                continue;
            }

            let take = (wanted - written).min(self.pending.len() - self.pending_pos);
            buffer[written..written + take]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
            written += take;
            self.pending_pos += take;
        }

        Ok(written / frame_size)
    }
}
