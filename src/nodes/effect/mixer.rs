//! Mixer effect - sums multiple inputs together

use crate::buffer::Buffer;
use crate::dsp;
use crate::error::Result;
use crate::node::{AudioNode, ChannelMode, Format, InitContext, ProcessContext};
use crate::param::{Param, ParamRef};

/// Default number of input busses of a [`Mixer`].
pub const DEFAULT_MAX_BUSSES: usize = 10;

/// Sums up to `max_busses` inputs and applies a master `volume` param.
///
/// The output has a fixed channel count. Mono inputs are copied to every
/// channel and multichannel inputs feeding a mono mixer are averaged.
pub struct Mixer {
    channels: usize,
    max_busses: usize,
    volume: ParamRef,
    curve: Vec<f32>,
}

impl Mixer {
    /// Create a new mixer with the specified number of output channels
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            max_busses: DEFAULT_MAX_BUSSES,
            volume: Param::new("volume", 1.0),
            curve: Vec::new(),
        }
    }

    pub fn stereo() -> Self {
        Self::new(2)
    }

    pub fn mono() -> Self {
        Self::new(1)
    }

    pub fn with_max_busses(mut self, max_busses: usize) -> Self {
        self.max_busses = max_busses.max(1);
        self
    }

    pub fn volume(&self) -> ParamRef {
        self.volume.clone()
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::stereo()
    }
}

impl AudioNode for Mixer {
    type Message = ();

    fn process(&mut self, ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, buffer: &mut Buffer) {
        let frames = buffer.num_frames();
        match super::param_curve(&self.volume, ctx, frames, &mut self.curve) {
            Some(curve) => dsp::multiply_by_curve(buffer, curve),
            None => {
                let volume = self.volume.value();
                if volume != 1.0 {
                    dsp::multiply(buffer, volume);
                }
            }
        }
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.curve.resize(ctx.frames_per_block, 0.0);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Mixer"
    }

    fn default_format(&self) -> Format {
        Format::new()
            .channels(self.channels)
            .channel_mode(ChannelMode::Specified)
            .auto_enable(true)
    }

    fn num_inputs(&self) -> usize {
        self.max_busses
    }

    fn params(&self) -> Vec<ParamRef> {
        vec![self.volume.clone()]
    }
}
