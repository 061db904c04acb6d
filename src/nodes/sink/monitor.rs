//! Signal tap for metering and scopes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::dsp;
use crate::node::{AudioNode, ChannelMode, Format, ProcessContext};
use crate::ring_buffer::{RingBuffer, RingReader, RingWriter};

/// Channels a [`Monitor`] can capture.
pub const MAX_MONITOR_CHANNELS: usize = 8;

/// Pass-through node copying every block into ring buffers read by a
/// [`MonitorReader`].
///
/// A monitor is auto-pullable: while nothing consumes its output the context
/// renders it anyway, so it can hang off any node without reaching the
/// target.
///
/// ```
/// use klanggraph::{Context, ContextConfig};
/// use klanggraph::nodes::{Monitor, NullOutput, Sine};
///
/// let ctx = Context::new(
///     ContextConfig::default()
///         .with_sample_rate(48_000)
///         .with_frames_per_block(480),
/// );
/// let out = ctx.make_node(NullOutput::new());
/// ctx.set_target(&out).unwrap();
///
/// let sine = ctx.make_node(Sine::new(1_000.0).with_amplitude(1.0));
/// let (monitor, mut reader) = Monitor::new(480);
/// let monitor = ctx.make_node(monitor);
/// sine.connect(&monitor).unwrap();
/// sine.start().unwrap();
///
/// ctx.initialize().unwrap();
/// ctx.start().unwrap();
/// ctx.render_block(|_| ());
///
/// reader.update();
/// assert!((reader.volume() - 0.707).abs() < 0.01);
/// ```
pub struct Monitor {
    writers: Vec<RingWriter>,
    channels: Arc<AtomicUsize>,
}

impl Monitor {
    /// Create a monitor whose reader keeps the last `window_frames` frames.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(window_frames: usize) -> (Monitor, MonitorReader) {
        let window_frames = window_frames.max(1);
        let capacity = (window_frames * 2).max(4096);
        let channels = Arc::new(AtomicUsize::new(0));

        let (writers, readers) = (0..MAX_MONITOR_CHANNELS)
            .map(|_| RingBuffer::new(capacity))
            .unzip();

        let monitor = Monitor {
            writers,
            channels: channels.clone(),
        };
        let reader = MonitorReader {
            readers,
            channels,
            window: vec![vec![0.0; window_frames]; MAX_MONITOR_CHANNELS],
            scratch: vec![0.0; capacity],
        };
        (monitor, reader)
    }
}

impl AudioNode for Monitor {
    type Message = ();

    fn process(&mut self, _ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, buffer: &mut Buffer) {
        let channels = buffer.num_channels().min(MAX_MONITOR_CHANNELS);
        self.channels.store(channels, Ordering::Release);
        // Frames that don't fit are dropped; the reader only wants the
        // newest window anyway.
        for (writer, samples) in self.writers.iter_mut().zip(buffer.channels()).take(channels) {
            writer.write(samples);
        }
    }

    fn name(&self) -> &'static str {
        "Monitor"
    }

    fn default_format(&self) -> Format {
        Format::new()
            .channel_mode(ChannelMode::MatchesInput)
            .auto_enable(true)
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        1
    }

    fn is_auto_pullable(&self) -> bool {
        true
    }
}

/// Control-thread side of a [`Monitor`].
pub struct MonitorReader {
    readers: Vec<RingReader>,
    channels: Arc<AtomicUsize>,
    window: Vec<Vec<f32>>,
    scratch: Vec<f32>,
}

impl MonitorReader {
    /// Move everything the monitor captured since the last call into the
    /// window.
    pub fn update(&mut self) {
        for (reader, window) in self.readers.iter_mut().zip(self.window.iter_mut()) {
            let n = reader.read(&mut self.scratch);
            if n == 0 {
                continue;
            }
            let len = window.len();
            if n >= len {
                window.copy_from_slice(&self.scratch[n - len..n]);
            } else {
                window.copy_within(n.., 0);
                window[len - n..].copy_from_slice(&self.scratch[..n]);
            }
        }
    }

    /// Channels the monitor saw in its last block.
    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.load(Ordering::Acquire)
    }

    /// The newest `window_frames` frames of one channel, oldest first.
    pub fn channel(&self, channel: usize) -> &[f32] {
        self.window.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// RMS level over the window of all captured channels.
    pub fn volume(&self) -> f32 {
        let channels = self.num_channels();
        if channels == 0 {
            return 0.0;
        }
        let power: f32 = self.window[..channels]
            .iter()
            .map(|w| dsp::rms(w).powi(2))
            .sum();
        (power / channels as f32).sqrt()
    }
}
