//! Audio file reading.
//!
//! A [`SourceFile`] reads PCM frames from a [`Decoder`] and delivers them in
//! an output format of the caller's choosing, converting through a
//! [`Converter`] when the native rate or channel count differs.

mod converter;
#[cfg(feature = "vorbis_src")]
mod vorbis;

use core::ops::Range;
use std::path::Path;

use dasp_sample::{Sample, ToSample};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};

pub use converter::{Converter, LinearConverter};
#[cfg(feature = "vorbis_src")]
pub use vorbis::VorbisDecoder;

/// Default number of native frames decoded per read.
pub const DEFAULT_FRAMES_PER_READ: usize = 4096;

/// A codec reader producing non-interleaved frames at a fixed native format.
pub trait Decoder: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> usize;

    /// Total length in native frames.
    fn num_frames(&self) -> u64;

    /// Decode up to `out.num_frames()` frames into the start of `out`.
    ///
    /// Returns the number of frames decoded; zero at end of stream.
    fn decode(&mut self, out: &mut Buffer) -> Result<usize>;

    /// Reposition to a native frame.
    fn seek(&mut self, frame: u64) -> Result<()>;
}

/// Decoder over samples already in memory.
pub struct MemoryDecoder {
    data: Buffer,
    sample_rate: u32,
    position: usize,
}

impl MemoryDecoder {
    pub fn new(data: Buffer, sample_rate: u32) -> Self {
        Self {
            data,
            sample_rate,
            position: 0,
        }
    }

    /// Build from interleaved samples of any sample type.
    pub fn from_interleaved<S>(samples: &[S], channels: usize, sample_rate: u32) -> Self
    where
        S: Sample + ToSample<f32>,
    {
        Self::new(Buffer::from_interleaved(samples, channels), sample_rate)
    }
}

impl Decoder for MemoryDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.data.num_channels()
    }

    fn num_frames(&self) -> u64 {
        self.data.num_frames() as u64
    }

    fn decode(&mut self, out: &mut Buffer) -> Result<usize> {
        let count = out
            .num_frames()
            .min(self.data.num_frames() - self.position);
        for (dest, source) in out.channels_mut().zip(self.data.channels()) {
            dest[..count].copy_from_slice(&source[self.position..self.position + count]);
        }
        self.position += count;
        Ok(count)
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        self.position = (frame as usize).min(self.data.num_frames());
        Ok(())
    }
}

/// A readable audio file with a selectable output format.
///
/// # Example
///
/// ```
/// use klanggraph::Buffer;
/// use klanggraph::file::{MemoryDecoder, SourceFile};
///
/// let samples: Vec<i16> = vec![0, 0, 16384, 16384, 0, 0];
/// let mut file = SourceFile::new(MemoryDecoder::from_interleaved(&samples, 2, 48_000));
/// assert_eq!(file.native_channels(), 2);
///
/// file.set_output_format(48_000, 1);
/// let mono = file.load_buffer().unwrap();
/// assert_eq!(mono.channel(0), &[0.0, 0.5, 0.0]);
/// ```
pub struct SourceFile {
    decoder: Box<dyn Decoder>,
    output_rate: u32,
    output_channels: usize,
    converter: Option<LinearConverter>,
    frames_per_read: usize,

    decoded: Buffer,
    converted: Buffer,
    /// Unread frames of the staged chunk.
    pending: Range<usize>,
    position: u64,
}

impl SourceFile {
    /// Wrap a decoder. The output format starts equal to the native format.
    pub fn new(decoder: impl Decoder + 'static) -> Self {
        Self::from_boxed(Box::new(decoder))
    }

    pub fn from_boxed(decoder: Box<dyn Decoder>) -> Self {
        let output_rate = decoder.sample_rate();
        let output_channels = decoder.channels();
        Self {
            decoder,
            output_rate,
            output_channels,
            converter: None,
            frames_per_read: DEFAULT_FRAMES_PER_READ,
            decoded: Buffer::default(),
            converted: Buffer::default(),
            pending: 0..0,
            position: 0,
        }
    }

    /// Samples already in memory.
    pub fn from_buffer(data: Buffer, sample_rate: u32) -> Self {
        Self::new(MemoryDecoder::new(data, sample_rate))
    }

    /// Open a file, choosing the decoder by extension.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let file = match extension.as_deref() {
            #[cfg(feature = "vorbis_src")]
            Some("ogg") | Some("oga") => Self::new(VorbisDecoder::open(path)?),
            other => {
                return Err(Error::InvalidFormat(format!(
                    "no decoder for extension {:?} of {}",
                    other,
                    path.display()
                )))
            }
        };
        debug!(
            path = %path.display(),
            sample_rate = file.native_sample_rate(),
            channels = file.native_channels(),
            frames = file.native_num_frames(),
            "opened source file"
        );
        Ok(file)
    }

    #[inline]
    pub fn native_sample_rate(&self) -> u32 {
        self.decoder.sample_rate()
    }

    #[inline]
    pub fn native_channels(&self) -> usize {
        self.decoder.channels()
    }

    #[inline]
    pub fn native_num_frames(&self) -> u64 {
        self.decoder.num_frames()
    }

    /// Output sample rate.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.output_rate
    }

    /// Output channel count.
    #[inline]
    pub fn channels(&self) -> usize {
        self.output_channels
    }

    /// Length in output frames.
    pub fn num_frames(&self) -> u64 {
        self.to_output_frames(self.native_num_frames())
    }

    /// Current read position in output frames.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    pub fn frames_per_read(&self) -> usize {
        self.frames_per_read
    }

    /// Limit how many native frames are decoded per refill.
    pub fn set_frames_per_read(&mut self, frames: usize) {
        self.frames_per_read = frames.max(1);
    }

    /// Choose the format frames are delivered in. Rewinds to the current
    /// position so no converted frames of the old format remain staged.
    pub fn set_output_format(&mut self, sample_rate: u32, channels: usize) {
        let channels = channels.max(1);
        let native_rate = self.native_sample_rate();
        let native_channels = self.native_channels();

        self.converter = if sample_rate != native_rate || channels != native_channels {
            Some(LinearConverter::new(native_rate, native_channels, sample_rate, channels))
        } else {
            None
        };

        let native_position = self.to_native_frames(self.position);
        self.output_rate = sample_rate;
        self.output_channels = channels;
        self.position = self.to_output_frames(native_position);
        self.pending = 0..0;
        if let Err(err) = self.decoder.seek(native_position) {
            warn!(error = %err, "rewind after format change failed");
        }
    }

    fn to_output_frames(&self, native: u64) -> u64 {
        let native_rate = self.native_sample_rate().max(1) as u128;
        (native as u128 * self.output_rate as u128 / native_rate) as u64
    }

    fn to_native_frames(&self, output: u64) -> u64 {
        let output_rate = self.output_rate.max(1) as u128;
        (output as u128 * self.native_sample_rate() as u128 / output_rate) as u64
    }

    /// Reposition to an output frame.
    pub fn seek(&mut self, frame: u64) -> Result<()> {
        let frame = frame.min(self.num_frames());
        self.decoder.seek(self.to_native_frames(frame))?;
        if let Some(converter) = &mut self.converter {
            converter.reset();
        }
        self.pending = 0..0;
        self.position = frame;
        Ok(())
    }

    /// Fill `buffer` from its first frame. Returns frames read; fewer than
    /// `buffer.num_frames()` only at end of stream.
    pub fn read(&mut self, buffer: &mut Buffer) -> Result<usize> {
        let count = buffer.num_frames();
        self.read_frames(buffer, 0, count)
    }

    /// Read up to `count` frames into `buffer` starting at frame `offset`.
    ///
    /// Buffer channels beyond the output channel count repeat the output
    /// channels cyclically.
    pub fn read_frames(&mut self, buffer: &mut Buffer, offset: usize, count: usize) -> Result<usize> {
        let count = count.min(buffer.num_frames().saturating_sub(offset));
        let mut written = 0;

        while written < count {
            if self.pending.is_empty() && !self.refill()? {
                break;
            }
            let staged = if self.converter.is_some() {
                &self.converted
            } else {
                &self.decoded
            };
            let n = self.pending.len().min(count - written);
            let start = self.pending.start;
            let channels = staged.num_channels().max(1);

            for (ch, dest) in buffer.channels_mut().enumerate() {
                let source = staged.channel(ch % channels);
                dest[offset + written..offset + written + n]
                    .copy_from_slice(&source[start..start + n]);
            }

            self.pending.start += n;
            written += n;
        }

        self.position += written as u64;
        Ok(written)
    }

    /// Decode and convert the next chunk. Returns false at end of stream.
    fn refill(&mut self) -> Result<bool> {
        let native_channels = self.native_channels();
        loop {
            self.decoded.resize(self.frames_per_read, native_channels);
            let decoded = self.decoder.decode(&mut self.decoded)?;
            if decoded == 0 {
                return Ok(false);
            }
            self.decoded.truncate_frames(decoded);

            let Some(converter) = &mut self.converter else {
                self.pending = 0..decoded;
                return Ok(true);
            };

            self.converted
                .resize(converter.max_output_frames(decoded), self.output_channels);
            let (_, produced) = converter.convert(&self.decoded, &mut self.converted);
            if produced > 0 {
                self.pending = 0..produced;
                return Ok(true);
            }
        }
    }

    /// Decode the whole file from the start in the output format.
    pub fn load_buffer(&mut self) -> Result<Buffer> {
        self.seek(0)?;
        let expected = self.num_frames() as usize;
        let mut buffer = Buffer::new(expected, self.output_channels);
        let mut read = self.read(&mut buffer)?;

        // Length estimates may be short (e.g. streams without a final granule).
        let mut chunk = Buffer::new(self.frames_per_read, self.output_channels);
        let mut tail: Vec<Vec<f32>> = vec![Vec::new(); self.output_channels];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            for (dest, source) in tail.iter_mut().zip(chunk.channels()) {
                dest.extend_from_slice(&source[..n]);
            }
        }

        if !tail[0].is_empty() {
            let channels: Vec<Vec<f32>> = buffer
                .channels()
                .zip(&tail)
                .map(|(head, tail)| head[..read].iter().chain(tail).copied().collect())
                .collect();
            read += tail[0].len();
            buffer = Buffer::from_channels(&channels);
        } else {
            buffer.truncate_frames(read);
        }

        debug!(frames = read, channels = self.output_channels, "loaded source file");
        Ok(buffer)
    }
}

impl core::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SourceFile")
            .field("native_sample_rate", &self.native_sample_rate())
            .field("native_channels", &self.native_channels())
            .field("sample_rate", &self.output_rate)
            .field("channels", &self.output_channels)
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_file(frames: usize, sample_rate: u32) -> SourceFile {
        let left: Vec<f32> = (0..frames).map(|i| i as f32).collect();
        let right: Vec<f32> = left.iter().map(|s| -s).collect();
        SourceFile::from_buffer(Buffer::from_channels(&[left, right]), sample_rate)
    }

    #[test]
    fn reads_in_native_format() {
        let mut file = counting_file(10, 44_100);
        file.set_frames_per_read(3);
        let mut buffer = Buffer::new(4, 2);

        assert_eq!(file.read(&mut buffer).unwrap(), 4);
        assert_eq!(buffer.channel(0), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(buffer.channel(1), &[0.0, -1.0, -2.0, -3.0]);

        assert_eq!(file.read(&mut buffer).unwrap(), 4);
        assert_eq!(file.read(&mut buffer).unwrap(), 2);
        assert_eq!(&buffer.channel(0)[..2], &[8.0, 9.0]);
        assert_eq!(file.read(&mut buffer).unwrap(), 0);
        assert_eq!(file.position(), 10);
    }

    #[test]
    fn seek_repositions() {
        let mut file = counting_file(10, 44_100);
        file.seek(7).unwrap();
        let mut buffer = Buffer::new(2, 2);
        file.read(&mut buffer).unwrap();
        assert_eq!(buffer.channel(0), &[7.0, 8.0]);
    }

    #[test]
    fn output_format_converts_rate_and_channels() {
        let mut file = counting_file(8, 22_050);
        file.set_output_format(44_100, 1);
        assert_eq!(file.num_frames(), 16);

        let buffer = file.load_buffer().unwrap();
        assert_eq!(buffer.num_channels(), 1);
        // Stereo channels cancel out when averaged.
        assert!(buffer.channel(0).iter().all(|s| *s == 0.0));
        assert_eq!(buffer.num_frames(), 15);
    }

    #[test]
    fn extra_buffer_channels_repeat_output_channels() {
        let mut file = SourceFile::from_buffer(Buffer::from_channels(&[vec![0.25; 4]]), 48_000);
        let mut buffer = Buffer::new(4, 2);
        file.read(&mut buffer).unwrap();
        assert_eq!(buffer.channel(1), &[0.25; 4]);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(matches!(
            SourceFile::open("sound.xyz"),
            Err(Error::InvalidFormat(_))
        ));
    }
}
