//! Gain/volume control effect

use crate::buffer::Buffer;
use crate::dsp;
use crate::error::Result;
use crate::node::{AudioNode, Format, InitContext, ProcessContext};
use crate::param::{Param, ParamRef};

/// Scales its input by the `gain` param (1.0 = unity, 0.0 = silence).
///
/// Gain changes are made through the param, either immediately with
/// [`Param::set_value`] or sample-accurately with [`Param::ramp_to`].
pub struct Gain {
    gain: ParamRef,
    curve: Vec<f32>,
}

impl Gain {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: Param::new("gain", gain),
            curve: Vec::new(),
        }
    }

    /// The `gain` param; also reachable through `Node::param("gain")`.
    pub fn gain(&self) -> ParamRef {
        self.gain.clone()
    }
}

impl AudioNode for Gain {
    type Message = ();

    fn process(&mut self, ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, buffer: &mut Buffer) {
        let frames = buffer.num_frames();
        match super::param_curve(&self.gain, ctx, frames, &mut self.curve) {
            Some(curve) => dsp::multiply_by_curve(buffer, curve),
            None => {
                let gain = self.gain.value();
                if gain != 1.0 {
                    dsp::multiply(buffer, gain);
                }
            }
        }
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.curve.resize(ctx.frames_per_block, 0.0);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Gain"
    }

    fn default_format(&self) -> Format {
        super::effect_format()
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        1
    }

    fn params(&self) -> Vec<ParamRef> {
        vec![self.gain.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn scales_every_channel() {
        let enabled = AtomicBool::new(true);
        let ctx = ProcessContext::new(48_000, 4, 0, &enabled);
        let mut gain = Gain::new(0.5);
        let mut buffer = Buffer::from_channels(&[vec![1.0; 4], vec![-2.0; 4]]);

        gain.process(&ctx, core::iter::empty(), &mut buffer);
        assert_eq!(buffer.channel(0), &[0.5; 4]);
        assert_eq!(buffer.channel(1), &[-1.0; 4]);
    }
}
