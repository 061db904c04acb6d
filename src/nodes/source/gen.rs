//! Oscillators and silence.

use crate::buffer::Buffer;
use crate::node::{AudioNode, Format, ProcessContext};

/// Messages to control an oscillator.
#[derive(Clone, Copy, Debug)]
pub enum OscMessage {
    SetFrequency(f32),
    SetAmplitude(f32),
}

/// Alias kept for the sine oscillator's message type.
pub type SineMessage = OscMessage;

/// Phase accumulator shared by the oscillators. Phase is in cycles.
#[derive(Clone, Copy, Debug)]
pub(super) struct Phasor {
    pub(super) frequency: f32,
    pub(super) amplitude: f32,
    phase: f32,
}

impl Phasor {
    pub(super) fn new(frequency: f32) -> Self {
        Self {
            frequency: frequency.max(0.0),
            amplitude: 0.25, // -12dB, safe default
            phase: 0.0,
        }
    }

    pub(super) fn handle(&mut self, messages: impl Iterator<Item = OscMessage>) {
        for msg in messages {
            match msg {
                OscMessage::SetFrequency(f) => self.frequency = f.max(0.0),
                OscMessage::SetAmplitude(a) => self.amplitude = a.clamp(0.0, 1.0),
            }
        }
    }

    /// Write the first channel with `shape`, then copy it to the rest.
    #[inline]
    pub(super) fn render(&mut self, sample_rate: u32, buffer: &mut Buffer, shape: impl Fn(f32) -> f32) {
        let phase_inc = (self.frequency / sample_rate.max(1) as f32).fract();
        let amplitude = self.amplitude;

        let mut channels = buffer.channels_mut();
        let Some(first) = channels.next() else {
            return;
        };
        for sample in first.iter_mut() {
            *sample = shape(self.phase) * amplitude;
            self.phase += phase_inc;
            // Branchless phase wrap (phase is always positive)
            self.phase -= (self.phase >= 1.0) as u32 as f32;
        }
        for channel in channels {
            channel.copy_from_slice(first);
        }
    }
}

/// A sine wave oscillator (mono source).
///
/// Like every source it starts disabled; call `start` on its node.
pub struct Sine {
    osc: Phasor,
}

impl Sine {
    pub fn new(frequency: f32) -> Self {
        Self {
            osc: Phasor::new(frequency),
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.osc.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.osc.frequency
    }

    #[inline]
    pub fn amplitude(&self) -> f32 {
        self.osc.amplitude
    }
}

impl AudioNode for Sine {
    type Message = OscMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = OscMessage>,
        buffer: &mut Buffer,
    ) {
        self.osc.handle(messages);
        self.osc
            .render(ctx.sample_rate, buffer, |phase| (phase * core::f32::consts::TAU).sin());
    }

    fn name(&self) -> &'static str {
        "Sine"
    }

    fn default_format(&self) -> Format {
        Format::new().channels(1)
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }
}

/// A naive (non band-limited) square wave oscillator.
pub struct Square {
    osc: Phasor,
}

impl Square {
    pub fn new(frequency: f32) -> Self {
        Self {
            osc: Phasor::new(frequency),
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.osc.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.osc.frequency
    }
}

impl AudioNode for Square {
    type Message = OscMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = OscMessage>,
        buffer: &mut Buffer,
    ) {
        self.osc.handle(messages);
        self.osc
            .render(ctx.sample_rate, buffer, |phase| if phase < 0.5 { 1.0 } else { -1.0 });
    }

    fn name(&self) -> &'static str {
        "Square"
    }

    fn default_format(&self) -> Format {
        Format::new().channels(1)
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }
}

/// Produces silence. Useful as a placeholder source or to keep a chain
/// rendering without input.
#[derive(Clone, Copy, Debug, Default)]
pub struct Silence;

impl Silence {
    pub fn new() -> Self {
        Self
    }
}

impl AudioNode for Silence {
    type Message = ();

    fn process(&mut self, _ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, buffer: &mut Buffer) {
        buffer.zero();
    }

    fn name(&self) -> &'static str {
        "Silence"
    }

    fn default_format(&self) -> Format {
        Format::new().channels(1)
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn sine_copies_first_channel() {
        let enabled = AtomicBool::new(true);
        let ctx = ProcessContext::new(48_000, 64, 0, &enabled);
        let mut sine = Sine::new(1_000.0).with_amplitude(1.0);
        let mut buffer = Buffer::new(64, 2);

        sine.process(&ctx, core::iter::empty(), &mut buffer);
        assert_eq!(buffer.channel(0), buffer.channel(1));
        assert_eq!(buffer.channel(0)[0], 0.0);
        // A quarter period of 1 kHz at 48 kHz is 12 frames.
        assert_relative_eq!(buffer.channel(0)[12], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn messages_update_oscillator() {
        let enabled = AtomicBool::new(true);
        let ctx = ProcessContext::new(48_000, 16, 0, &enabled);
        let mut square = Square::new(100.0);
        let mut buffer = Buffer::new(16, 1);

        square.process(
            &ctx,
            [OscMessage::SetAmplitude(0.5), OscMessage::SetFrequency(-3.0)].into_iter(),
            &mut buffer,
        );
        assert_eq!(square.frequency(), 0.0);
        assert!(buffer.channel(0).iter().all(|s| *s == 0.5));
    }
}
