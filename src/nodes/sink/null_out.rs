//! Device-less render target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::node::{AudioNode, ChannelMode, Format, InitContext, ProcessContext};

/// A target without a device.
///
/// By default nothing drives the render: call
/// [`Context::render_block`] yourself, e.g. for offline rendering and tests.
/// [`with_timer`](Self::with_timer) adds a thread that renders one block per
/// block period while the context runs.
pub struct NullOutput {
    timer: bool,
    context: Weak<Context>,
    alive: Arc<AtomicBool>,
}

impl NullOutput {
    pub fn new() -> Self {
        Self {
            timer: false,
            context: Weak::new(),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Render in real time from a software timer thread.
    pub fn with_timer() -> Self {
        let mut out = Self::new();
        out.timer = true;
        out
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for NullOutput {
    type Message = ();

    fn process(&mut self, _ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, _buffer: &mut Buffer) {}

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.context = ctx.weak_context();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.timer || self.alive.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let context = self.context.clone();
        if context.strong_count() == 0 {
            self.alive.store(false, Ordering::Release);
            return Err(Error::NotInitialized);
        }

        let alive = self.alive.clone();
        thread::Builder::new()
            .name("klanggraph-null-out".into())
            .spawn(move || run_timer(context, alive))?;
        Ok(())
    }

    fn stop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }

    fn name(&self) -> &'static str {
        "NullOutput"
    }

    fn default_format(&self) -> Format {
        Format::new()
            .channels(2)
            .channel_mode(ChannelMode::Specified)
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        0
    }
}

impl Drop for NullOutput {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

fn run_timer(context: Weak<Context>, alive: Arc<AtomicBool>) {
    let mut deadline = Instant::now();
    while alive.load(Ordering::Acquire) {
        let Some(ctx) = context.upgrade() else {
            break;
        };
        let period = Duration::from_secs_f64(
            ctx.frames_per_block() as f64 / ctx.sample_rate().max(1) as f64,
        );
        ctx.render_block(|_| ());
        drop(ctx);

        deadline += period;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else {
            // Fell behind; don't try to catch up in a burst.
            deadline = now;
        }
    }
    debug!("null output timer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;

    #[test]
    fn timer_renders_while_running() {
        let ctx = Context::new(
            ContextConfig::default()
                .with_sample_rate(1_000)
                .with_frames_per_block(10),
        );
        let out = ctx.make_node(NullOutput::with_timer());
        ctx.set_target(&out).unwrap();
        ctx.initialize().unwrap();
        ctx.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.processed_frames() < 30 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        ctx.stop();
        assert!(ctx.processed_frames() >= 30);
        assert_eq!(ctx.processed_frames() % 10, 0);
    }

    #[test]
    fn plain_output_does_not_render_by_itself() {
        let ctx = Context::new(ContextConfig::default());
        let out = ctx.make_node(NullOutput::new());
        ctx.set_target(&out).unwrap();
        ctx.initialize().unwrap();
        ctx.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ctx.processed_frames(), 0);
    }
}
