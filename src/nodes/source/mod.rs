//! Sources: nodes without inputs.
//!
//! Sources are mono by default and start disabled; call `start` on their
//! node to make them produce sound.

mod gen;
#[cfg(feature = "cpal_io")]
mod line_in;
mod player;
mod wavetable;

pub use gen::{OscMessage, Silence, Sine, SineMessage, Square};
#[cfg(feature = "cpal_io")]
pub use line_in::{LineIn, LineInStatus};
pub use player::{BufferPlayer, FilePlayer, PlayerMessage, PlayerStatus};
pub use wavetable::{WaveTable, WaveTableOsc, Waveform};
