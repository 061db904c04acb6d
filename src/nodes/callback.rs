//! Closure-backed node.

use crate::buffer::Buffer;
use crate::node::{AudioNode, ChannelMode, Format, ProcessContext};

/// Runs a user closure on every block, in place.
///
/// Follows its input's channel count and is auto-enabled, like the effects.
///
/// ```
/// use klanggraph::nodes::Callback;
///
/// // Hard clip at ±0.5.
/// let clip = Callback::new(|_ctx, buffer| {
///     buffer.data_mut().iter_mut().for_each(|s| *s = s.clamp(-0.5, 0.5));
/// });
/// ```
pub struct Callback<F> {
    f: F,
}

impl<F> Callback<F>
where
    F: FnMut(&ProcessContext, &mut Buffer) + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> AudioNode for Callback<F>
where
    F: FnMut(&ProcessContext, &mut Buffer) + Send + 'static,
{
    type Message = ();

    fn process(&mut self, ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, buffer: &mut Buffer) {
        (self.f)(ctx, buffer);
    }

    fn name(&self) -> &'static str {
        "Callback"
    }

    fn default_format(&self) -> Format {
        Format::new()
            .channel_mode(ChannelMode::MatchesInput)
            .auto_enable(true)
    }
}
