//! klanggraph - pull-based real-time audio graph
//!
//! Design principles:
//! - A [`Context`] owns the render target and serializes topology changes
//!   against the render pass with one short-held lock
//! - Consumers own their inputs; output edges are weak bookkeeping only
//! - Channel counts are negotiated when connections change, never at render
//!   time; single-input same-width chains render in place
//! - Nodes receive control messages through lock-free queues, and automatable
//!   values through sample-accurate [`Param`]s
//! - Devices and files are collaborators behind small interfaces
//!
//! # Quick start
//!
//! ```
//! use klanggraph::{Context, ContextConfig};
//! use klanggraph::nodes::{Gain, NullOutput, Sine};
//!
//! let ctx = Context::new(ContextConfig::default());
//! let out = ctx.make_node(NullOutput::new());
//! ctx.set_target(&out).unwrap();
//!
//! let sine = ctx.make_node(Sine::new(440.0));
//! let gain = ctx.make_node(Gain::new(0.25));
//! sine.connect(&gain).unwrap().connect(&out).unwrap();
//! sine.start().unwrap();
//!
//! ctx.initialize().unwrap();
//! ctx.start().unwrap();
//! ctx.render_block(|block| assert_eq!(block.num_channels(), 2));
//! ```

mod buffer;
mod context;
mod error;
mod node;
mod param;
mod ring_buffer;

pub mod dsp;
pub mod file;
pub mod nodes;

#[cfg(feature = "cpal_io")]
mod device;

pub use buffer::{Buffer, Layout};
pub use context::{Context, ContextConfig, DEFAULT_QUEUE_SIZE};
pub use error::{Error, Result};
pub use node::{
    AudioNode, ChannelMode, Format, InitContext, Node, NodeHandle, NodeId, NodeRef, ProcessContext,
};
pub use param::{Param, ParamRef, RampEvent};
pub use ring_buffer::{RingBuffer, RingReader, RingWriter};

#[cfg(feature = "cpal_io")]
pub use device::CpalDevice;
