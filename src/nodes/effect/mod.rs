//! Effects: nodes that transform the block their inputs rendered.
//!
//! All of them follow their inputs' channel count and are auto-enabled, so
//! they start processing as soon as they are initialized. [`Mixer`] is the
//! exception: it has a fixed channel count.

mod gain;
mod mixer;
mod pan;
mod ring_mod;
mod slew_limiter;

pub use gain::Gain;
pub use mixer::Mixer;
pub use pan::Pan2d;
pub use ring_mod::{RingMod, RingModMessage};
pub use slew_limiter::{SlewLimiter, SlewLimiterMessage};

use crate::node::{ChannelMode, Format, ProcessContext};
use crate::param::Param;

/// Format shared by the effects.
fn effect_format() -> Format {
    Format::new()
        .channel_mode(ChannelMode::MatchesInput)
        .auto_enable(true)
}

/// Evaluate `param` over the current block into `curve`.
///
/// Returns `None` when no ramp touches the block; the caller then uses
/// [`Param::value`].
fn param_curve<'c>(
    param: &Param,
    ctx: &ProcessContext,
    frames: usize,
    curve: &'c mut [f32],
) -> Option<&'c [f32]> {
    let end = ctx.processed_frames + frames as u64;
    if !param.is_varying_in(end) {
        return None;
    }
    let frames = frames.min(curve.len());
    let curve = &mut curve[..frames];
    param.eval(ctx.processed_frames, end, curve, ctx.sample_rate);
    Some(curve)
}
