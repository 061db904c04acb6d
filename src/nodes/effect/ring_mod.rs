//! Ring modulator.

use core::f32::consts::TAU;

use crate::buffer::Buffer;
use crate::node::{AudioNode, Format, ProcessContext};

#[derive(Clone, Copy, Debug)]
pub enum RingModMessage {
    /// Carrier frequency in Hz.
    SetFrequency(f32),
}

/// Multiplies its input by a sine carrier.
pub struct RingMod {
    frequency: f32,
    phase: f32,
}

impl RingMod {
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency: frequency.max(0.0),
            phase: 0.0,
        }
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.frequency
    }
}

impl AudioNode for RingMod {
    type Message = RingModMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = RingModMessage>,
        buffer: &mut Buffer,
    ) {
        for msg in messages {
            match msg {
                RingModMessage::SetFrequency(f) => self.frequency = f.max(0.0),
            }
        }

        let phase_inc = (self.frequency / ctx.sample_rate.max(1) as f32).fract();
        let start = self.phase;
        let mut phase = start;
        for channel in buffer.channels_mut() {
            // Every channel sees the same carrier.
            phase = start;
            for sample in channel.iter_mut() {
                *sample *= (phase * TAU).sin();
                phase += phase_inc;
                phase -= (phase >= 1.0) as u32 as f32;
            }
        }
        self.phase = phase;
    }

    fn name(&self) -> &'static str {
        "RingMod"
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
    use approx::assert_relative_eq;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn modulates_with_carrier() {
        let enabled = AtomicBool::new(true);
        let ctx = ProcessContext::new(400, 4, 0, &enabled);
        let mut ring = RingMod::new(100.0);
        let mut buffer = Buffer::from_channels(&[vec![1.0; 4], vec![2.0; 4]]);

        ring.process(&ctx, core::iter::empty(), &mut buffer);
        // A quarter period per frame: sin(0), sin(pi/2), sin(pi), sin(3pi/2).
        let expected = [0.0, 1.0, 0.0, -1.0];
        for (sample, expected) in buffer.channel(0).iter().zip(expected) {
            assert_relative_eq!(*sample, expected, epsilon = 1e-5);
        }
        assert_relative_eq!(buffer.channel(1)[1], 2.0, epsilon = 1e-5);
    }
}
