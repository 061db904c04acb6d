//! Multi-channel sample storage.
//!
//! A [`Buffer`] owns `channels × frames` 32-bit samples in one contiguous
//! allocation. Non-interleaved buffers are channel-major, so each channel is a
//! contiguous slice; interleaved buffers are frame-major and are only used at
//! device and file boundaries.

use dasp_sample::{Sample, ToSample};

/// Memory layout of a [`Buffer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Layout {
    /// Channel-major: `[c0 f0, c0 f1, .., c1 f0, ..]`.
    #[default]
    NonInterleaved,
    /// Frame-major: `[f0 c0, f0 c1, .., f1 c0, ..]`.
    Interleaved,
}

/// Fixed-shape block of audio samples.
///
/// The layout never changes after construction. Frame and channel counts only
/// change through [`resize`](Self::resize), which clears the contents.
///
/// # Example
///
/// ```
/// use klanggraph::Buffer;
///
/// let mut buffer = Buffer::new(64, 2);
/// buffer.channel_mut(1).fill(0.5);
/// assert_eq!(buffer.channel(0)[0], 0.0);
/// assert_eq!(buffer.channel(1)[63], 0.5);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Buffer {
    data: Vec<f32>,
    num_frames: usize,
    num_channels: usize,
    layout: Layout,
}

impl Buffer {
    /// Create a zeroed, non-interleaved buffer.
    pub fn new(num_frames: usize, num_channels: usize) -> Self {
        Self::with_layout(num_frames, num_channels, Layout::NonInterleaved)
    }

    /// Create a zeroed, interleaved buffer.
    pub fn new_interleaved(num_frames: usize, num_channels: usize) -> Self {
        Self::with_layout(num_frames, num_channels, Layout::Interleaved)
    }

    pub fn with_layout(num_frames: usize, num_channels: usize, layout: Layout) -> Self {
        Self {
            data: vec![0.0; num_frames * num_channels],
            num_frames,
            num_channels,
            layout,
        }
    }

    /// Build a non-interleaved buffer from interleaved samples of any sample
    /// type (`i16`, `u8`, `f32`, ..). Trailing samples that do not fill a
    /// whole frame are dropped.
    pub fn from_interleaved<S>(samples: &[S], num_channels: usize) -> Self
    where
        S: Sample + ToSample<f32>,
    {
        let num_channels = num_channels.max(1);
        let num_frames = samples.len() / num_channels;
        let mut buffer = Self::new(num_frames, num_channels);
        for (frame, chunk) in samples.chunks_exact(num_channels).enumerate() {
            for (ch, sample) in chunk.iter().enumerate() {
                buffer.data[ch * num_frames + frame] = sample.to_sample::<f32>();
            }
        }
        buffer
    }

    /// Build a non-interleaved buffer from one `Vec` per channel.
    ///
    /// Channels shorter than the longest one are padded with silence.
    pub fn from_channels(channels: &[Vec<f32>]) -> Self {
        let num_frames = channels.iter().map(Vec::len).max().unwrap_or(0);
        let mut buffer = Self::new(num_frames, channels.len());
        for (dest, source) in buffer.channels_mut().zip(channels) {
            dest[..source.len()].copy_from_slice(source);
        }
        buffer
    }

    #[inline]
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Total number of samples (`frames × channels`).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whole-block access in the buffer's native layout.
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Samples of one channel. Only valid for non-interleaved buffers.
    #[inline]
    pub fn channel(&self, channel: usize) -> &[f32] {
        debug_assert_eq!(self.layout, Layout::NonInterleaved);
        let start = channel * self.num_frames;
        &self.data[start..start + self.num_frames]
    }

    #[inline]
    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        debug_assert_eq!(self.layout, Layout::NonInterleaved);
        let start = channel * self.num_frames;
        &mut self.data[start..start + self.num_frames]
    }

    /// Iterate over channel slices of a non-interleaved buffer.
    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        debug_assert_eq!(self.layout, Layout::NonInterleaved);
        self.data.chunks_exact(self.num_frames.max(1))
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        debug_assert_eq!(self.layout, Layout::NonInterleaved);
        self.data.chunks_exact_mut(self.num_frames.max(1))
    }

    /// Set every sample to zero.
    #[inline]
    pub fn zero(&mut self) {
        self.data.fill(0.0);
    }

    #[inline]
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Change the shape of the buffer and zero it.
    ///
    /// Growing past the current allocation reallocates; shrinking or
    /// growing within it does not.
    pub fn resize(&mut self, num_frames: usize, num_channels: usize) {
        self.num_frames = num_frames;
        self.num_channels = num_channels;
        self.data.clear();
        self.data.resize(num_frames * num_channels, 0.0);
    }

    /// Reserve room for `num_frames × num_channels` samples without changing
    /// the current shape.
    pub fn reserve(&mut self, num_frames: usize, num_channels: usize) {
        let wanted = num_frames * num_channels;
        if wanted > self.data.capacity() {
            self.data.reserve(wanted - self.data.len());
        }
    }

    /// Shrink the frame count to `num_frames`, keeping the first
    /// `num_frames` samples of every channel.
    pub fn truncate_frames(&mut self, num_frames: usize) {
        if num_frames >= self.num_frames {
            return;
        }
        self.retain_frames(0, num_frames);
    }

    /// Drop the first `count` frames of every channel, shifting the rest to
    /// the front.
    pub fn discard_front(&mut self, count: usize) {
        let count = count.min(self.num_frames);
        let remaining = self.num_frames - count;
        self.retain_frames(count, remaining);
    }

    fn retain_frames(&mut self, offset: usize, count: usize) {
        match self.layout {
            Layout::NonInterleaved => {
                for ch in 0..self.num_channels {
                    let start = ch * self.num_frames + offset;
                    self.data.copy_within(start..start + count, ch * count);
                }
            }
            Layout::Interleaved => {
                let channels = self.num_channels;
                self.data
                    .copy_within(offset * channels..(offset + count) * channels, 0);
            }
        }
        self.num_frames = count;
        self.data.truncate(count * self.num_channels);
    }

    /// Copy `source` into this buffer. Shapes must match.
    pub fn copy_from(&mut self, source: &Buffer) {
        debug_assert_eq!(self.num_channels, source.num_channels);
        let len = self.data.len().min(source.data.len());
        self.data[..len].copy_from_slice(&source.data[..len]);
    }

    /// Copy the first `count` frames of `source` into this buffer starting at
    /// frame `offset`. Both buffers must be non-interleaved with equal channel
    /// counts.
    pub fn copy_frames_from(&mut self, source: &Buffer, offset: usize, count: usize) {
        let count = count.min(source.num_frames).min(self.num_frames.saturating_sub(offset));
        for (dest, src) in self.channels_mut().zip(source.channels()) {
            dest[offset..offset + count].copy_from_slice(&src[..count]);
        }
    }

    /// Write this non-interleaved buffer into `out` as interleaved frames.
    pub fn interleave_into(&self, out: &mut [f32]) {
        let channels = self.num_channels;
        for (ch, samples) in self.channels().enumerate().take(channels) {
            for (frame, sample) in samples.iter().enumerate() {
                if let Some(slot) = out.get_mut(frame * channels + ch) {
                    *slot = *sample;
                }
            }
        }
    }

    /// Fill this non-interleaved buffer from interleaved `input`.
    pub fn deinterleave_from(&mut self, input: &[f32]) {
        let channels = self.num_channels;
        for (ch, samples) in self.channels_mut().enumerate() {
            for (frame, sample) in samples.iter_mut().enumerate() {
                *sample = input.get(frame * channels + ch).copied().unwrap_or(0.0);
            }
        }
    }
}
