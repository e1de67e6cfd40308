//! Streamable audio sources

mod decoded;
mod pcm;

pub use decoded::DecodedFileSource;
pub use pcm::PcmSource;

/// A finite, non-restartable stream of interleaved PCM frames.
///
/// Implementations describe their layout once and then hand out raw frame bytes
/// on demand; a pump never asks for more than it can fit in one buffer.
pub trait AudioSource: Send {
    /// Frames per second
    fn frame_rate(&self) -> u32;

    /// 1 (mono) or 2 (stereo)
    fn channel_count(&self) -> u16;

    /// Bytes per sample: 1 (unsigned 8-bit) or 2 (signed 16-bit little endian)
    fn sample_size(&self) -> u16;

    /// Bytes per interleaved frame
    fn frame_size(&self) -> usize {
        self.channel_count() as usize * self.sample_size() as usize
    }

    /// Copy up to `max_frames` frames into `buffer` and return how many were
    /// written. `Ok(0)` means the source is exhausted.
    ///
    /// `buffer` holds at least `max_frames * frame_size()` bytes.
    fn read(&mut self, buffer: &mut [u8], max_frames: usize) -> std::io::Result<usize>;
}

impl<S: AudioSource + ?Sized> AudioSource for Box<S> {
    fn frame_rate(&self) -> u32 {
        (**self).frame_rate()
    }

    fn channel_count(&self) -> u16 {
        (**self).channel_count()
    }

    fn sample_size(&self) -> u16 {
        (**self).sample_size()
    }

    fn frame_size(&self) -> usize {
        (**self).frame_size()
    }

    fn read(&mut self, buffer: &mut [u8], max_frames: usize) -> std::io::Result<usize> {
        (**self).read(buffer, max_frames)
    }
}
