//! Sample-accurate parameter automation.
//!
//! A [`Param`] holds a scalar value and at most one linear ramp. Ramps are
//! scheduled on the control thread against the owning context's frame clock
//! and evaluated block by block on the audio thread.
//!
//! Outside the ramp window the value is held: frames before the ramp begins
//! keep the previous value and frames after it end keep the target.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::context::Context;
use crate::error::{Error, Result};

/// Shared handle to a [`Param`].
pub type ParamRef = Arc<Param>;

/// A scheduled linear ramp.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RampEvent {
    /// First frame of the ramp; this frame still carries `start_value`.
    pub begin_frame: u64,
    /// Frame at which the ramp reaches `end_value`.
    pub end_frame: u64,
    pub total_seconds: f32,
    pub start_value: f32,
    pub end_value: f32,
    /// Per-frame increment.
    pub increment: f32,
}

impl RampEvent {
    #[inline]
    fn value_at(&self, frame: u64) -> f32 {
        if frame < self.begin_frame {
            self.start_value
        } else if frame >= self.end_frame {
            self.end_value
        } else {
            self.start_value + self.increment * (frame - self.begin_frame) as f32
        }
    }
}

struct ParamState {
    value: f32,
    event: Option<RampEvent>,
    context: Weak<Context>,
}

/// An automatable node parameter.
///
/// # Example
///
/// ```
/// use klanggraph::{Context, ContextConfig};
/// use klanggraph::nodes::{Gain, NullOutput};
///
/// let ctx = Context::new(ContextConfig::default());
/// let out = ctx.make_node(NullOutput::new());
/// ctx.set_target(&out).unwrap();
///
/// let gain = ctx.make_node(Gain::new(1.0));
/// let param = gain.param("gain").unwrap();
/// assert!(param.ramp_to(0.0, 0.5).is_err());
///
/// // Connecting initializes the node, which binds its params to the
/// // context's frame clock.
/// gain.connect(&out).unwrap();
/// param.ramp_to(0.0, 0.5).unwrap();
/// assert_eq!(param.event().unwrap().end_frame, 22_050);
/// ```
pub struct Param {
    name: &'static str,
    state: Mutex<ParamState>,
}

impl Param {
    /// Create an unbound parameter with an initial value.
    pub fn new(name: &'static str, value: f32) -> ParamRef {
        Arc::new(Self {
            name,
            state: Mutex::new(ParamState {
                value,
                event: None,
                context: Weak::new(),
            }),
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bind the frame clock of `context`. Called when the owning node is
    /// initialized.
    pub(crate) fn bind(&self, context: Weak<Context>) {
        self.state.lock().context = context;
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().context.strong_count() > 0
    }

    /// Current scalar value.
    pub fn value(&self) -> f32 {
        self.state.lock().value
    }

    /// Set the value immediately, cancelling any pending ramp.
    pub fn set_value(&self, value: f32) {
        let mut state = self.state.lock();
        state.value = value;
        state.event = None;
    }

    /// Ramp linearly from the current value to `value` over `seconds`,
    /// starting at the context's current frame.
    ///
    /// Replaces any ramp that is still in flight. Takes the context lock,
    /// so it must not be called from inside `process`.
    pub fn ramp_to(&self, value: f32, seconds: f32) -> Result<()> {
        let context = self
            .state
            .lock()
            .context
            .upgrade()
            .ok_or(Error::ParamUnbound(self.name))?;

        let _graph = context.lock();
        let begin_frame = context.processed_frames();
        let duration = (seconds.max(0.0) * context.sample_rate() as f32).round() as u64;
        let end_frame = begin_frame + duration;

        let mut state = self.state.lock();
        let start_value = state.value;
        let increment = if duration == 0 {
            0.0
        } else {
            (value - start_value) / duration as f32
        };

        state.event = Some(RampEvent {
            begin_frame,
            end_frame,
            total_seconds: seconds,
            start_value,
            end_value: value,
            increment,
        });

        trace!(
            param = self.name,
            from = start_value,
            to = value,
            begin_frame,
            end_frame,
            "scheduled ramp"
        );
        Ok(())
    }

    /// The pending ramp, if any.
    pub fn event(&self) -> Option<RampEvent> {
        self.state.lock().event
    }

    /// Whether a ramp overlaps the next block of the bound context.
    pub fn is_varying_next_eval(&self) -> bool {
        let state = self.state.lock();
        let Some(event) = state.event else {
            return false;
        };
        let Some(context) = state.context.upgrade() else {
            return true;
        };
        let end = context.processed_frames() + context.frames_per_block() as u64;
        Self::is_varying(&event, end)
    }

    /// Whether a ramp has to be evaluated for a block ending at `end_frame`.
    pub fn is_varying_in(&self, end_frame: u64) -> bool {
        self.state
            .lock()
            .event
            .map_or(false, |event| Self::is_varying(&event, end_frame))
    }

    #[inline]
    fn is_varying(event: &RampEvent, end_frame: u64) -> bool {
        // A ramp that ended before the window still has to be applied once.
        event.begin_frame < end_frame
    }

    /// Fill `out` with one value per frame of `[begin_frame, end_frame)`.
    ///
    /// Clears the ramp once the window reaches its end frame. The sample rate
    /// is only used for logging; the ramp is already expressed in frames.
    pub fn eval(&self, begin_frame: u64, end_frame: u64, out: &mut [f32], sample_rate: u32) {
        let mut state = self.state.lock();
        let frames = ((end_frame.saturating_sub(begin_frame)) as usize).min(out.len());

        let Some(event) = state.event else {
            out[..frames].fill(state.value);
            return;
        };

        let mut value = state.value;
        for (offset, sample) in out[..frames].iter_mut().enumerate() {
            let frame = begin_frame + offset as u64;
            if frame >= event.begin_frame {
                value = event.value_at(frame);
            }
            *sample = value;
        }
        state.value = value;

        if end_frame >= event.end_frame {
            state.value = event.end_value;
            state.event = None;
            trace!(param = self.name, sample_rate, "ramp finished");
        }
    }
}

impl core::fmt::Debug for Param {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("value", &state.value)
            .field("event", &state.event)
            .finish()
    }
}
