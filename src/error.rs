//! Error types for graph configuration and collaborator failures.
//!
//! Only configuration problems and backend/file failures are errors. Buffer
//! underruns and overruns on the audio thread are counted by the node that
//! sees them and never surface here.

use thiserror::Error;

use crate::node::NodeId;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("node {0:?} cannot be connected to itself")]
    SelfConnection(NodeId),

    #[error("node {input:?} is already an input of {node:?}")]
    DuplicateInput { node: NodeId, input: NodeId },

    #[error("connecting {input:?} to {node:?} would create a cycle")]
    Cycle { node: NodeId, input: NodeId },

    #[error("bus {bus} of node {node:?} is already occupied")]
    BusOccupied { node: NodeId, bus: usize },

    #[error("bus {bus} is out of range for node {node:?} (max {max})")]
    BusOutOfRange { node: NodeId, bus: usize, max: usize },

    #[error("node {0:?} has no free input bus")]
    NoFreeBus(NodeId),

    #[error("node {0:?} does not accept inputs")]
    NoInputBusses(NodeId),

    #[error("node {0:?} has no outputs and cannot be connected downstream")]
    NoOutputs(NodeId),

    #[error("cannot mix {from} channels from {input:?} into {to} channels of {node:?}")]
    IncompatibleChannels {
        node: NodeId,
        input: NodeId,
        from: usize,
        to: usize,
    },

    #[error("nodes belong to different contexts")]
    ContextMismatch,

    #[error("node {0:?} has already been released")]
    NodeReleased(NodeId),

    #[error("the owning context has been dropped")]
    ContextDropped,

    #[error("the context has no target node")]
    NoTarget,

    #[error("the context is not initialized")]
    NotInitialized,

    #[error("param '{0}' is not bound to a context yet")]
    ParamUnbound(&'static str),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "vorbis_src")]
    #[error("vorbis decode failed: {0}")]
    Vorbis(#[from] lewton::VorbisError),

    #[error("audio device error: {0}")]
    Device(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
