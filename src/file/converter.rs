//! Sample rate and channel conversion outside the graph.
//!
//! Streaming linear interpolation: consecutive calls continue where the
//! previous one stopped, keeping the last consumed frame so chunk borders
//! interpolate seamlessly.

use crate::buffer::Buffer;

/// Bridges a sample rate or channel count mismatch between a collaborator
/// and the graph.
pub trait Converter: Send {
    /// Convert as much of `source` as fits into `dest`.
    ///
    /// Returns `(frames_consumed, frames_produced)`. Unconsumed source frames
    /// must be passed again at the front of the next call.
    fn convert(&mut self, source: &Buffer, dest: &mut Buffer) -> (usize, usize);

    /// Forget the stream history, e.g. after a seek.
    fn reset(&mut self);

    /// Upper bound of frames produced from `source_frames` input frames.
    fn max_output_frames(&self, source_frames: usize) -> usize;
}

/// Linear-interpolating rate converter with channel mapping.
///
/// Channel mapping: equal counts copy, a mono source is broadcast, a mono
/// destination receives the average of all source channels, and any other
/// combination maps destination channel `n` to source channel
/// `n % source_channels`.
///
/// ```
/// use klanggraph::Buffer;
/// use klanggraph::file::{Converter, LinearConverter};
///
/// let mut converter = LinearConverter::new(22_050, 1, 44_100, 2);
/// let source = Buffer::from_channels(&[vec![0.0, 1.0, 2.0, 3.0]]);
/// let mut dest = Buffer::new(16, 2);
///
/// let (consumed, produced) = converter.convert(&source, &mut dest);
/// assert_eq!(consumed, 4);
/// assert_eq!(produced, 7);
/// assert_eq!(&dest.channel(1)[..3], &[0.0, 0.5, 1.0]);
/// ```
#[derive(Clone, Debug)]
pub struct LinearConverter {
    source_rate: u32,
    dest_rate: u32,
    source_channels: usize,
    dest_channels: usize,
    /// Source frames advanced per output frame.
    step: f64,
    /// Read position relative to the next chunk; `-1.0` addresses `last`.
    position: f64,
    last: Vec<f32>,
}

impl LinearConverter {
    pub fn new(source_rate: u32, source_channels: usize, dest_rate: u32, dest_channels: usize) -> Self {
        let source_channels = source_channels.max(1);
        Self {
            source_rate,
            dest_rate,
            source_channels,
            dest_channels: dest_channels.max(1),
            step: source_rate.max(1) as f64 / dest_rate.max(1) as f64,
            position: 0.0,
            last: vec![0.0; source_channels],
        }
    }

    #[inline]
    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    #[inline]
    pub fn dest_rate(&self) -> u32 {
        self.dest_rate
    }

    #[inline]
    pub fn source_channels(&self) -> usize {
        self.source_channels
    }

    #[inline]
    pub fn dest_channels(&self) -> usize {
        self.dest_channels
    }

    #[inline]
    fn frame_sample(&self, source: &Buffer, channel: usize, index: isize) -> f32 {
        if index < 0 {
            self.last[channel]
        } else {
            source.channel(channel)[index as usize]
        }
    }

    fn source_sample(&self, source: &Buffer, dest_channel: usize, index: isize) -> f32 {
        let channels = self.source_channels;
        if channels == self.dest_channels {
            self.frame_sample(source, dest_channel, index)
        } else if channels == 1 {
            self.frame_sample(source, 0, index)
        } else if self.dest_channels == 1 {
            let sum: f32 = (0..channels).map(|ch| self.frame_sample(source, ch, index)).sum();
            sum / channels as f32
        } else {
            self.frame_sample(source, dest_channel % channels, index)
        }
    }
}

impl Converter for LinearConverter {
    fn convert(&mut self, source: &Buffer, dest: &mut Buffer) -> (usize, usize) {
        let frames = source.num_frames();
        if frames == 0 || source.num_channels() < self.source_channels {
            return (0, 0);
        }
        let last_index = (frames - 1) as f64;
        let capacity = dest.num_frames();
        let dest_channels = self.dest_channels.min(dest.num_channels());

        let mut produced = 0;
        while produced < capacity && self.position <= last_index {
            let index = self.position.floor();
            let frac = (self.position - index) as f32;
            let index = index as isize;

            for ch in 0..dest_channels {
                let a = self.source_sample(source, ch, index);
                let value = if frac > 0.0 {
                    let b = self.source_sample(source, ch, index + 1);
                    a + (b - a) * frac
                } else {
                    a
                };
                dest.channel_mut(ch)[produced] = value;
            }

            produced += 1;
            self.position += self.step;
        }

        let consumed = if self.position > last_index {
            frames
        } else {
            self.position.floor().max(0.0) as usize
        };
        if consumed > 0 {
            for (ch, last) in self.last.iter_mut().enumerate() {
                *last = source.channel(ch)[consumed - 1];
            }
        }
        self.position -= consumed as f64;

        (consumed, produced)
    }

    fn reset(&mut self) {
        self.position = 0.0;
        self.last.fill(0.0);
    }

    fn max_output_frames(&self, source_frames: usize) -> usize {
        ((source_frames as f64 + 1.0) / self.step).ceil() as usize + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(frames: usize, offset: f32) -> Buffer {
        Buffer::from_channels(&[(0..frames).map(|i| i as f32 + offset).collect()])
    }

    #[test]
    fn equal_rates_pass_through() {
        let mut converter = LinearConverter::new(48_000, 1, 48_000, 1);
        let source = ramp(8, 0.0);
        let mut dest = Buffer::new(8, 1);
        assert_eq!(converter.convert(&source, &mut dest), (8, 8));
        assert_eq!(dest.channel(0), source.channel(0));
    }

    #[test]
    fn upsampling_interpolates_across_chunks() {
        let mut converter = LinearConverter::new(24_000, 1, 48_000, 1);
        let mut dest = Buffer::new(32, 1);

        let (consumed, produced) = converter.convert(&ramp(4, 0.0), &mut dest);
        assert_eq!((consumed, produced), (4, 7));
        assert_eq!(&dest.channel(0)[..7], &[0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0]);

        // The next chunk continues the ramp, starting halfway from the last frame.
        let (consumed, produced) = converter.convert(&ramp(4, 4.0), &mut dest);
        assert_eq!(consumed, 4);
        assert_eq!(produced, 8);
        assert_eq!(&dest.channel(0)[..4], &[3.5, 4.0, 4.5, 5.0]);
    }

    #[test]
    fn downsampling_produces_fewer_frames() {
        let mut converter = LinearConverter::new(48_000, 1, 24_000, 1);
        let mut dest = Buffer::new(32, 1);
        let (consumed, produced) = converter.convert(&ramp(8, 0.0), &mut dest);
        assert_eq!(consumed, 8);
        assert_eq!(produced, 4);
        assert_eq!(&dest.channel(0)[..4], &[0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn small_destination_consumes_partially() {
        let mut converter = LinearConverter::new(48_000, 1, 48_000, 1);
        let mut dest = Buffer::new(3, 1);
        let (consumed, produced) = converter.convert(&ramp(8, 0.0), &mut dest);
        assert_eq!((consumed, produced), (3, 3));

        let rest = ramp(5, 3.0);
        let (consumed, produced) = converter.convert(&rest, &mut dest);
        assert_eq!((consumed, produced), (3, 3));
        assert_eq!(dest.channel(0), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn stereo_averages_into_mono() {
        let mut converter = LinearConverter::new(44_100, 2, 44_100, 1);
        let source = Buffer::from_channels(&[vec![1.0, 1.0], vec![0.0, -1.0]]);
        let mut dest = Buffer::new(2, 1);
        converter.convert(&source, &mut dest);
        assert_relative_eq!(dest.channel(0)[0], 0.5);
        assert_relative_eq!(dest.channel(0)[1], 0.0);
    }

    #[test]
    fn reset_forgets_history() {
        let mut converter = LinearConverter::new(24_000, 1, 48_000, 1);
        let mut dest = Buffer::new(16, 1);
        converter.convert(&ramp(3, 10.0), &mut dest);
        converter.reset();
        let (_, produced) = converter.convert(&ramp(2, 0.0), &mut dest);
        assert_eq!(&dest.channel(0)[..produced], &[0.0, 0.5, 1.0]);
    }
}
