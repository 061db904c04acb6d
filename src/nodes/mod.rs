//! Built-in audio nodes.
//!
//! Nodes are organized into three categories:
//!
//! ## Sources ([`source`])
//!
//! Generate audio with no audio inputs:
//! - [`Sine`], [`Square`] - oscillators with frequency/amplitude control
//! - [`WaveTableOsc`] - band-limited square, sawtooth and triangle from a [`WaveTable`]
//! - [`Silence`] - a placeholder source
//! - [`BufferPlayer`] - play a buffer held in memory
//! - [`FilePlayer`] - stream a [`SourceFile`](crate::file::SourceFile)
//! - `LineIn` - capture an input device (requires `cpal_io`)
//!
//! ## Effects ([`effect`])
//!
//! Process the block their inputs rendered:
//! - [`Gain`] - volume control through the `gain` param
//! - [`Pan2d`] - equal-power stereo panner
//! - [`RingMod`] - sine ring modulator
//! - [`SlewLimiter`] - smooth rapid changes (for control signals)
//! - [`Mixer`] - sum several inputs with a master volume
//! - [`Callback`] - run a closure on every block
//!
//! ## Sinks ([`sink`])
//!
//! - [`NullOutput`] - target without a device, driven manually or by a timer
//! - `LineOut` - output to a system audio device (requires `cpal_io`)
//! - [`Monitor`] - auto-pulled tap read through a [`MonitorReader`]
//!
//! # Message Types
//!
//! Nodes with runtime controls that are not params take messages through
//! their [`NodeHandle`](crate::NodeHandle):
//! - [`OscMessage`] - control [`Sine`], [`Square`] and [`WaveTableOsc`]
//! - [`PlayerMessage`] - seek and loop the players
//! - [`RingModMessage`] - carrier frequency of [`RingMod`]
//! - [`SlewLimiterMessage`] - rate of [`SlewLimiter`]
//!
//! Nodes without messages (like [`Mixer`]) use `()` as their message type.

mod callback;
pub mod effect;
pub mod sink;
pub mod source;

pub use callback::Callback;
pub use effect::{Gain, Mixer, Pan2d, RingMod, RingModMessage, SlewLimiter, SlewLimiterMessage};
pub use sink::{Monitor, MonitorReader, NullOutput};
pub use source::{
    BufferPlayer, FilePlayer, OscMessage, PlayerMessage, PlayerStatus, Silence, Sine, SineMessage,
    Square, WaveTable, WaveTableOsc, Waveform,
};

#[cfg(feature = "cpal_io")]
pub use sink::LineOut;
#[cfg(feature = "cpal_io")]
pub use source::{LineIn, LineInStatus};
