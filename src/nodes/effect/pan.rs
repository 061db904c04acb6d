//! Stereo panner.

use core::f32::consts::FRAC_PI_2;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::node::{AudioNode, ChannelMode, Format, InitContext, ProcessContext};
use crate::param::{Param, ParamRef};

/// Equal-power stereo panner.
///
/// Always outputs two channels. Mono input is broadcast to both sides
/// before panning; for stereo input each side is scaled by its gain. The `position` param ranges from -1 (left)
/// through 0 (center) to 1 (right).
pub struct Pan2d {
    position: ParamRef,
    curve: Vec<f32>,
}

impl Pan2d {
    pub fn new() -> Self {
        Self {
            position: Param::new("position", 0.0),
            curve: Vec::new(),
        }
    }

    pub fn position(&self) -> ParamRef {
        self.position.clone()
    }

    #[inline]
    fn gains(position: f32) -> (f32, f32) {
        let theta = (position.clamp(-1.0, 1.0) + 1.0) * 0.5 * FRAC_PI_2;
        (theta.cos(), theta.sin())
    }
}

impl Default for Pan2d {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for Pan2d {
    type Message = ();

    fn process(&mut self, ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, buffer: &mut Buffer) {
        if buffer.num_channels() < 2 {
            return;
        }
        let frames = buffer.num_frames();
        let data = buffer.data_mut();
        let (left, rest) = data.split_at_mut(frames);
        let right = &mut rest[..frames];

        match super::param_curve(&self.position, ctx, frames, &mut self.curve) {
            Some(curve) => {
                for ((l, r), position) in left.iter_mut().zip(right.iter_mut()).zip(curve) {
                    let (gl, gr) = Self::gains(*position);
                    *l *= gl;
                    *r *= gr;
                }
            }
            None => {
                let (gl, gr) = Self::gains(self.position.value());
                left.iter_mut().for_each(|s| *s *= gl);
                right.iter_mut().for_each(|s| *s *= gr);
            }
        }
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.curve.resize(ctx.frames_per_block, 0.0);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Pan2d"
    }

    fn default_format(&self) -> Format {
        Format::new()
            .channels(2)
            .channel_mode(ChannelMode::Specified)
            .auto_enable(true)
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        1
    }

    fn params(&self) -> Vec<ParamRef> {
        vec![self.position.clone()]
    }
}
