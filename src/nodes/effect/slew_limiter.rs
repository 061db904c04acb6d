//! Slew rate limiter.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::node::{AudioNode, Format, InitContext, ProcessContext};

#[derive(Clone, Copy, Debug)]
pub enum SlewLimiterMessage {
    /// Largest change allowed between consecutive samples.
    SetMaxDelta(f32),
}

/// Limits how fast each channel can change, smoothing steps in control
/// signals and clicks in audio.
pub struct SlewLimiter {
    max_delta: f32,
    last: Vec<f32>,
}

impl SlewLimiter {
    pub fn new() -> Self {
        Self::with_max_delta(1.0 / 3072.0)
    }

    pub fn with_max_delta(max_delta: f32) -> Self {
        Self {
            max_delta: max_delta.abs(),
            last: Vec::new(),
        }
    }

    #[inline]
    pub fn max_delta(&self) -> f32 {
        self.max_delta
    }
}

impl Default for SlewLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for SlewLimiter {
    type Message = SlewLimiterMessage;

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        messages: impl Iterator<Item = SlewLimiterMessage>,
        buffer: &mut Buffer,
    ) {
        for msg in messages {
            match msg {
                SlewLimiterMessage::SetMaxDelta(delta) => self.max_delta = delta.abs(),
            }
        }

        let max_delta = self.max_delta;
        for (channel, last) in buffer.channels_mut().zip(self.last.iter_mut()) {
            for sample in channel.iter_mut() {
                let delta = (*sample - *last).clamp(-max_delta, max_delta);
                *last += delta;
                *sample = *last;
            }
        }
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.last.resize(ctx.num_channels, 0.0);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SlewLimiter"
    }

    fn default_format(&self) -> Format {
        super::effect_format()
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn step_becomes_ramp() {
        let enabled = AtomicBool::new(true);
        let ctx = ProcessContext::new(48_000, 4, 0, &enabled);
        let mut slew = SlewLimiter::with_max_delta(0.25);
        slew.last = vec![0.0];

        let mut buffer = Buffer::from_channels(&[vec![1.0; 6]]);
        slew.process(&ctx, core::iter::empty(), &mut buffer);
        assert_eq!(buffer.channel(0), &[0.25, 0.5, 0.75, 1.0, 1.0, 1.0]);
    }
}
