//! Graph vertices, the node trait and the pull render.
//!
//! A [`Node`] is a shared vertex (`Arc<Node>`) wrapping a type-erased
//! [`AudioNode`] implementation. Input edges own the upstream node; output
//! edges are weak and only used for bookkeeping. Every block the target
//! calls [`Node::pull_inputs`], which recursively renders the graph
//! upstream-first, either in place in the caller's buffer or through the
//! node's own summing buffers when negotiation requires it.

use core::fmt;
use core::ptr;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use delegate::delegate;
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::context::{Context, GraphState};
use crate::dsp;
use crate::error::{Error, Result};
use crate::param::ParamRef;

/// Shared handle to a graph vertex.
pub type NodeRef = Arc<Node>;

const NOT_RENDERED: u64 = u64::MAX;

/// Unique identifier for a node within a [`Context`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// How a node's channel count is resolved against its neighbours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelMode {
    /// Fixed channel count.
    Specified,
    /// Adopt the largest channel count among the inputs.
    #[default]
    MatchesInput,
    /// Adopt the channel count of the output.
    MatchesOutput,
}

/// Construction-time format of a node.
///
/// Fields left unset fall back to the node kind's
/// [`default_format`](AudioNode::default_format). Setting a channel count
/// without a mode implies [`ChannelMode::Specified`].
///
/// ```
/// use klanggraph::{ChannelMode, Format};
///
/// let format = Format::new().channels(2);
/// assert_eq!(format.num_channels(), Some(2));
/// assert_eq!(format.mode(), None);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Format {
    channels: Option<usize>,
    channel_mode: Option<ChannelMode>,
    auto_enable: Option<bool>,
}

impl Format {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = Some(channels.max(1));
        self
    }

    pub fn channel_mode(mut self, mode: ChannelMode) -> Self {
        self.channel_mode = Some(mode);
        self
    }

    pub fn auto_enable(mut self, auto_enable: bool) -> Self {
        self.auto_enable = Some(auto_enable);
        self
    }

    #[inline]
    pub fn num_channels(&self) -> Option<usize> {
        self.channels
    }

    #[inline]
    pub fn mode(&self) -> Option<ChannelMode> {
        self.channel_mode
    }

    #[inline]
    pub fn is_auto_enable(&self) -> Option<bool> {
        self.auto_enable
    }

    /// Fill unset fields from `defaults`.
    pub fn or(self, defaults: Format) -> Format {
        let channel_mode = self
            .channel_mode
            .or_else(|| self.channels.map(|_| ChannelMode::Specified))
            .or(defaults.channel_mode);
        Format {
            channels: self.channels.or(defaults.channels),
            channel_mode,
            auto_enable: self.auto_enable.or(defaults.auto_enable),
        }
    }

    fn resolve(self) -> (usize, ChannelMode, bool) {
        let mode = self.channel_mode.unwrap_or(if self.channels.is_some() {
            ChannelMode::Specified
        } else {
            ChannelMode::MatchesInput
        });
        (self.channels.unwrap_or(1), mode, self.auto_enable.unwrap_or(false))
    }
}

/// Information available during audio processing.
///
/// Passed to every [`AudioNode::process`] call.
#[derive(Clone, Copy, Debug)]
pub struct ProcessContext<'a> {
    /// Sample rate of the context in Hz.
    pub sample_rate: u32,
    /// Frames in the block being rendered.
    pub frames_per_block: usize,
    /// Frame clock at the first frame of this block.
    pub processed_frames: u64,
    enabled: &'a AtomicBool,
}

impl<'a> ProcessContext<'a> {
    pub fn new(
        sample_rate: u32,
        frames_per_block: usize,
        processed_frames: u64,
        enabled: &'a AtomicBool,
    ) -> Self {
        Self {
            sample_rate,
            frames_per_block,
            processed_frames,
            enabled,
        }
    }

    /// Frame clock one past the last frame of this block.
    #[inline]
    pub fn block_end_frame(&self) -> u64 {
        self.processed_frames + self.frames_per_block as u64
    }

    /// Disable the node being processed. Takes effect from the next block;
    /// players use this to stop themselves at the end of their material.
    #[inline]
    pub fn disable_node(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

/// Information handed to [`AudioNode::initialize`].
#[derive(Clone, Debug)]
pub struct InitContext {
    pub sample_rate: u32,
    pub frames_per_block: usize,
    pub num_channels: usize,
    pub node_id: NodeId,
    context: Weak<Context>,
}

impl InitContext {
    /// The owning context, if it is still alive.
    pub fn context(&self) -> Option<Arc<Context>> {
        self.context.upgrade()
    }

    /// A non-owning handle to the owning context, for backend threads that
    /// drive the render.
    pub fn weak_context(&self) -> Weak<Context> {
        self.context.clone()
    }
}

/// The core trait for audio processing nodes.
///
/// Implementors provide the per-block `process` body plus a few descriptors
/// the graph reads once when the node is created. Nodes are placed in a graph
/// with [`Context::make_node`], which returns a [`NodeHandle`] used both for
/// connecting and for sending [`Message`](AudioNode::Message)s.
///
/// ```
/// use klanggraph::{AudioNode, Buffer, Format, ProcessContext};
///
/// enum DcMessage {
///     SetLevel(f32),
/// }
///
/// struct Dc {
///     level: f32,
/// }
///
/// impl AudioNode for Dc {
///     type Message = DcMessage;
///
///     fn process(
///         &mut self,
///         _ctx: &ProcessContext,
///         messages: impl Iterator<Item = DcMessage>,
///         buffer: &mut Buffer,
///     ) {
///         for msg in messages {
///             match msg {
///                 DcMessage::SetLevel(level) => self.level = level,
///             }
///         }
///         buffer.fill(self.level);
///     }
///
///     fn num_inputs(&self) -> usize { 0 }
///
///     fn default_format(&self) -> Format {
///         Format::new().channels(1)
///     }
/// }
/// ```
pub trait AudioNode: Send + 'static {
    /// Message type for control updates. Use `()` for nodes without any.
    type Message: Send + 'static;

    /// Process one block in place.
    ///
    /// `buffer` holds the inputs' rendered output for this block (silence for
    /// sources) and is overwritten with this node's output. Drain `messages`
    /// first. Must not allocate, lock for long, or block.
    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = Self::Message>,
        buffer: &mut Buffer,
    );

    /// Allocate per-node state. Called on the control thread whenever the
    /// node is (re)initialized, e.g. after its channel count changed.
    fn initialize(&mut self, _ctx: &InitContext) -> Result<()> {
        Ok(())
    }

    fn uninitialize(&mut self) {}

    /// Called when the node is enabled.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the node is disabled from the control thread.
    fn stop(&mut self) {}

    /// Whether this node can render `input_channels` directly into a block of
    /// `own_channels`. The default accepts only equal counts.
    fn supports_input_channels(&self, input_channels: usize, own_channels: usize) -> bool {
        input_channels == own_channels
    }

    /// Short name used in logs and graph dumps.
    fn name(&self) -> &'static str {
        "Node"
    }

    /// Format used when [`Context::make_node`] is not given one.
    fn default_format(&self) -> Format {
        Format::default()
    }

    /// Maximum number of input busses (0 for sources).
    fn num_inputs(&self) -> usize {
        usize::MAX
    }

    /// Number of outputs (0 for sinks and render targets).
    fn num_outputs(&self) -> usize {
        1
    }

    /// Automatable parameters, looked up by name through [`Node::param`].
    fn params(&self) -> Vec<ParamRef> {
        Vec::new()
    }

    /// Nodes that must still be rendered while nothing consumes their output.
    fn is_auto_pullable(&self) -> bool {
        false
    }

    /// Native sample rate, for nodes bound to a device.
    ///
    /// A render target with a native rate sets the context's rate when it is
    /// installed with [`Context::set_target`].
    fn native_sample_rate(&self) -> Option<u32> {
        None
    }

    /// Native block size, for nodes bound to a device.
    fn native_frames_per_block(&self) -> Option<usize> {
        None
    }
}

// Type-erased wrapper so we can store heterogeneous nodes
trait ErasedNode: Send {
    fn process(&mut self, ctx: &ProcessContext, buffer: &mut Buffer);
    fn initialize(&mut self, ctx: &InitContext) -> Result<()>;
    fn uninitialize(&mut self);
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    fn supports_input_channels(&self, input_channels: usize, own_channels: usize) -> bool;
}

struct NodeWrapper<N: AudioNode> {
    node: N,
    receiver: Consumer<N::Message>,
}

impl<N: AudioNode> ErasedNode for NodeWrapper<N> {
    fn process(&mut self, ctx: &ProcessContext, buffer: &mut Buffer) {
        let receiver = &mut self.receiver;
        let node = &mut self.node;

        // Draining iterator straight from the consumer, no allocation
        let messages = core::iter::from_fn(|| receiver.pop().ok());
        node.process(ctx, messages, buffer);
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.node.initialize(ctx)
    }

    fn uninitialize(&mut self) {
        self.node.uninitialize();
    }

    fn start(&mut self) -> Result<()> {
        self.node.start()
    }

    fn stop(&mut self) {
        self.node.stop();
    }

    fn supports_input_channels(&self, input_channels: usize, own_channels: usize) -> bool {
        self.node.supports_input_channels(input_channels, own_channels)
    }
}

struct RenderState {
    processor: Box<dyn ErasedNode>,
    internal: Buffer,
    summing: Buffer,
}

/// Frame clock snapshot handed down one render pass.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockClock {
    pub(crate) sample_rate: u32,
    pub(crate) processed_frames: u64,
}

/// A vertex of the audio graph.
///
/// Created by [`Context::make_node`]. All topology changes take the owning
/// context's lock, so they are safe to call from any control thread while
/// the graph is rendering.
pub struct Node {
    id: NodeId,
    name: &'static str,
    self_ref: Weak<Node>,
    context: Weak<Context>,

    channel_mode: ChannelMode,
    num_channels: AtomicUsize,
    max_inputs: usize,
    num_outputs: usize,
    auto_pullable: bool,
    native_sample_rate: Option<u32>,
    native_frames_per_block: Option<usize>,

    enabled: AtomicBool,
    initialized: AtomicBool,
    auto_enable: AtomicBool,
    process_in_place: AtomicBool,
    /// Frame clock of the block last rendered into the summing buffer.
    rendered_frame: AtomicU64,

    inputs: Mutex<BTreeMap<usize, NodeRef>>,
    outputs: Mutex<Vec<Weak<Node>>>,
    params: Vec<ParamRef>,
    render: Mutex<RenderState>,
}

impl Node {
    pub(crate) fn create<N: AudioNode>(
        id: NodeId,
        context: Weak<Context>,
        node: N,
        format: Format,
        queue_size: usize,
    ) -> (NodeRef, Producer<N::Message>) {
        let (num_channels, channel_mode, auto_enable) = format.or(node.default_format()).resolve();
        let name = node.name();
        let max_inputs = node.num_inputs();
        let num_outputs = node.num_outputs();
        let auto_pullable = node.is_auto_pullable();
        let native_sample_rate = node.native_sample_rate();
        let native_frames_per_block = node.native_frames_per_block();
        let params = node.params();

        let (sender, receiver) = RingBuffer::new(queue_size.max(1));
        let processor: Box<dyn ErasedNode> = Box::new(NodeWrapper { node, receiver });

        let node = Arc::new_cyclic(|self_ref| Node {
            id,
            name,
            self_ref: self_ref.clone(),
            context,
            channel_mode,
            num_channels: AtomicUsize::new(num_channels),
            max_inputs,
            num_outputs,
            auto_pullable,
            native_sample_rate,
            native_frames_per_block,
            enabled: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            auto_enable: AtomicBool::new(auto_enable),
            process_in_place: AtomicBool::new(true),
            rendered_frame: AtomicU64::new(NOT_RENDERED),
            inputs: Mutex::new(BTreeMap::new()),
            outputs: Mutex::new(Vec::new()),
            params,
            render: Mutex::new(RenderState {
                processor,
                internal: Buffer::default(),
                summing: Buffer::default(),
            }),
        });

        (node, sender)
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The owning context, if it is still alive.
    pub fn context(&self) -> Option<Arc<Context>> {
        self.context.upgrade()
    }

    fn require_context(&self) -> Result<Arc<Context>> {
        self.context.upgrade().ok_or(Error::ContextDropped)
    }

    pub(crate) fn shared(&self) -> Result<NodeRef> {
        self.self_ref.upgrade().ok_or(Error::NodeReleased(self.id))
    }

    pub(crate) fn belongs_to(&self, context: &Context) -> bool {
        ptr::eq(self.context.as_ptr(), context)
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.num_channels.load(Ordering::Acquire)
    }

    #[inline]
    pub fn channel_mode(&self) -> ChannelMode {
        self.channel_mode
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_auto_enabled(&self) -> bool {
        self.auto_enable.load(Ordering::Acquire)
    }

    /// Auto-enabled nodes start as soon as they are initialized and stop
    /// before they are uninitialized.
    pub fn set_auto_enabled(&self, auto_enable: bool) {
        self.auto_enable.store(auto_enable, Ordering::Release);
    }

    /// Whether the last negotiation chose in-place rendering.
    #[inline]
    pub fn process_in_place(&self) -> bool {
        self.process_in_place.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_auto_pullable(&self) -> bool {
        self.auto_pullable
    }

    #[inline]
    pub fn native_sample_rate(&self) -> Option<u32> {
        self.native_sample_rate
    }

    #[inline]
    pub fn native_frames_per_block(&self) -> Option<usize> {
        self.native_frames_per_block
    }

    /// Maximum number of input busses.
    #[inline]
    pub fn max_inputs(&self) -> usize {
        self.max_inputs
    }

    /// Frames held by the internal summing buffers; zero while the node
    /// renders in place.
    pub fn internal_buffer_frames(&self) -> usize {
        self.render.lock().internal.num_frames()
    }

    pub fn params(&self) -> &[ParamRef] {
        &self.params
    }

    /// Look up a parameter by name.
    pub fn param(&self, name: &str) -> Option<ParamRef> {
        self.params.iter().find(|p| p.name() == name).cloned()
    }

    // ---- topology queries ----

    pub fn num_connected_inputs(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Connected inputs in bus order.
    pub fn inputs(&self) -> Vec<(usize, NodeRef)> {
        self.inputs
            .lock()
            .iter()
            .map(|(bus, node)| (*bus, node.clone()))
            .collect()
    }

    pub fn input(&self, bus: usize) -> Option<NodeRef> {
        self.inputs.lock().get(&bus).cloned()
    }

    /// Live downstream nodes.
    pub fn outputs(&self) -> Vec<NodeRef> {
        self.outputs.lock().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn has_outputs(&self) -> bool {
        self.outputs.lock().iter().any(|w| w.strong_count() > 0)
    }

    pub fn is_connected_to_input<N: AsRef<Node> + ?Sized>(&self, node: &N) -> bool {
        let node = node.as_ref();
        self.inputs.lock().values().any(|n| ptr::eq(&**n, node))
    }

    pub fn is_connected_to_output<N: AsRef<Node> + ?Sized>(&self, node: &N) -> bool {
        let node = node.as_ref();
        self.outputs
            .lock()
            .iter()
            .any(|w| ptr::eq(w.as_ptr(), node) && w.strong_count() > 0)
    }

    fn bus_of(&self, node: &Node) -> Option<usize> {
        self.inputs
            .lock()
            .iter()
            .find(|(_, n)| ptr::eq(&***n, node))
            .map(|(bus, _)| *bus)
    }

    /// Whether `node` is upstream of this node through any path.
    fn depends_on(&self, node: &Node) -> bool {
        self.inputs
            .lock()
            .values()
            .any(|n| ptr::eq(&**n, node) || n.depends_on(node))
    }

    // ---- connections ----

    /// Make this node an input of `dest` at its first free bus.
    ///
    /// Returns `dest` so connections can be chained.
    ///
    /// ```
    /// use klanggraph::{Context, ContextConfig};
    /// use klanggraph::nodes::{Gain, NullOutput, Sine};
    ///
    /// let ctx = Context::new(ContextConfig::default());
    /// let out = ctx.make_node(NullOutput::new());
    /// ctx.set_target(&out).unwrap();
    ///
    /// let sine = ctx.make_node(Sine::new(440.0));
    /// let gain = ctx.make_node(Gain::new(0.5));
    /// sine.connect(&gain).unwrap().connect(&out).unwrap();
    ///
    /// assert!(gain.is_connected_to_input(&sine));
    /// assert!(sine.is_connected_to_output(&gain));
    /// ```
    pub fn connect<N: AsRef<Node> + ?Sized>(&self, dest: &N) -> Result<NodeRef> {
        let dest = dest.as_ref();
        dest.add_input(self)?;
        dest.shared()
    }

    /// Make this node an input of `dest` at `bus`.
    pub fn connect_bus<N: AsRef<Node> + ?Sized>(&self, dest: &N, bus: usize) -> Result<NodeRef> {
        let dest = dest.as_ref();
        dest.set_input(self, bus)?;
        dest.shared()
    }

    /// Add `input` at the first unused bus, scanning upwards from 0.
    pub fn add_input<N: AsRef<Node> + ?Sized>(&self, input: &N) -> Result<usize> {
        self.connect_input(input.as_ref(), None)
    }

    /// Add `input` at `bus`.
    pub fn set_input<N: AsRef<Node> + ?Sized>(&self, input: &N, bus: usize) -> Result<()> {
        self.connect_input(input.as_ref(), Some(bus)).map(|_| ())
    }

    fn connect_input(&self, input: &Node, bus: Option<usize>) -> Result<usize> {
        let context = self.require_context()?;
        let input = input.shared()?;
        let bus = {
            let mut graph = context.lock();
            self.set_input_locked(&mut graph, &input, bus)?
        };
        context.connections_did_change(self);
        Ok(bus)
    }

    pub(crate) fn set_input_locked(
        &self,
        graph: &mut GraphState,
        input: &NodeRef,
        bus: Option<usize>,
    ) -> Result<usize> {
        self.check_input(input)?;

        let bus = {
            let mut inputs = self.inputs.lock();
            let bus = match bus {
                Some(bus) if bus >= self.max_inputs => {
                    return Err(Error::BusOutOfRange {
                        node: self.id,
                        bus,
                        max: self.max_inputs,
                    })
                }
                Some(bus) if inputs.contains_key(&bus) => {
                    return Err(Error::BusOccupied { node: self.id, bus })
                }
                Some(bus) => bus,
                None => (0..self.max_inputs)
                    .find(|bus| !inputs.contains_key(bus))
                    .ok_or(Error::NoFreeBus(self.id))?,
            };
            inputs.insert(bus, input.clone());
            bus
        };
        input.add_output(self);

        if let Err(err) = self.configure_connections(graph) {
            self.inputs.lock().remove(&bus);
            input.remove_output(self);
            if let Err(rollback) = self.configure_connections(graph) {
                warn!(node = %self, error = %rollback, "renegotiation after rollback failed");
            }
            return Err(err);
        }

        if input.outputs().len() > 1 {
            input.reconfigure(graph);
        }
        graph.update_auto_pull(input);
        if let Ok(this) = self.shared() {
            graph.update_auto_pull(&this);
        }
        graph.refresh_buffers();

        debug!(input = %input, node = %self, bus, "connected");
        Ok(bus)
    }

    fn check_input(&self, input: &Node) -> Result<()> {
        if ptr::eq(self, input) {
            return Err(Error::SelfConnection(self.id));
        }
        if !Weak::ptr_eq(&self.context, &input.context) {
            return Err(Error::ContextMismatch);
        }
        if self.max_inputs == 0 {
            return Err(Error::NoInputBusses(self.id));
        }
        if input.num_outputs == 0 {
            return Err(Error::NoOutputs(input.id));
        }
        if self.is_connected_to_input(input) {
            return Err(Error::DuplicateInput {
                node: self.id,
                input: input.id,
            });
        }
        if input.depends_on(self) {
            return Err(Error::Cycle {
                node: self.id,
                input: input.id,
            });
        }
        Ok(())
    }

    fn add_output(&self, output: &Node) {
        let mut outputs = self.outputs.lock();
        outputs.retain(|w| w.strong_count() > 0);
        if !outputs.iter().any(|w| ptr::eq(w.as_ptr(), output)) {
            outputs.push(output.self_ref.clone());
        }
    }

    fn remove_output(&self, output: &Node) {
        self.outputs
            .lock()
            .retain(|w| w.strong_count() > 0 && !ptr::eq(w.as_ptr(), output));
    }

    /// Remove every edge touching this node: it leaves all of its outputs'
    /// input busses and drops all of its own inputs.
    pub fn disconnect(&self) -> Result<()> {
        let context = self.require_context()?;
        let affected = {
            let mut graph = context.lock();
            let affected = self.outputs();
            self.disconnect_locked(&mut graph);
            affected
        };
        context.connections_did_change(self);
        for output in &affected {
            context.connections_did_change(output);
        }
        Ok(())
    }

    pub(crate) fn disconnect_locked(&self, graph: &mut GraphState) {
        // Our only owner may be one of the busses cleared below.
        let keep_alive = self.self_ref.upgrade();

        let outputs = core::mem::take(&mut *self.outputs.lock());
        for output in outputs.iter().filter_map(Weak::upgrade) {
            output.inputs.lock().retain(|_, n| !ptr::eq(&**n, self));
            if let Err(err) = output.configure_connections(graph) {
                warn!(node = %output, error = %err, "renegotiation after disconnect failed");
            }
            graph.update_auto_pull(&output);
        }

        let inputs = core::mem::take(&mut *self.inputs.lock());
        for input in inputs.values() {
            input.remove_output(self);
            if input.has_outputs() {
                input.reconfigure(graph);
            }
            graph.update_auto_pull(input);
        }
        drop(inputs);

        if let Err(err) = self.configure_connections(graph) {
            warn!(node = %self, error = %err, "renegotiation after disconnect failed");
        }
        if let Some(this) = &keep_alive {
            graph.update_auto_pull(this);
        }
        graph.refresh_buffers();
        debug!(node = %self, "disconnected");
    }

    /// Remove the input at `bus`, returning it.
    pub fn disconnect_input(&self, bus: usize) -> Result<Option<NodeRef>> {
        let context = self.require_context()?;
        let removed = {
            let mut graph = context.lock();
            self.disconnect_input_locked(&mut graph, bus)
        };
        if removed.is_some() {
            context.connections_did_change(self);
        }
        Ok(removed)
    }

    fn disconnect_input_locked(&self, graph: &mut GraphState, bus: usize) -> Option<NodeRef> {
        let removed = self.inputs.lock().remove(&bus)?;
        removed.remove_output(self);
        if removed.has_outputs() {
            removed.reconfigure(graph);
        }

        if let Err(err) = self.configure_connections(graph) {
            warn!(node = %self, error = %err, "renegotiation after disconnect failed");
        }
        graph.update_auto_pull(&removed);
        if let Ok(this) = self.shared() {
            graph.update_auto_pull(&this);
        }
        graph.refresh_buffers();
        debug!(input = %removed, node = %self, bus, "disconnected input");
        Some(removed)
    }

    /// Remove the edge from this node into `output`.
    pub fn disconnect_output<N: AsRef<Node> + ?Sized>(&self, output: &N) -> Result<()> {
        let output = output.as_ref();
        let Some(bus) = output.bus_of(self) else {
            return Ok(());
        };
        output.disconnect_input(bus).map(|_| ())
    }

    // ---- negotiation ----

    /// Resolve channel counts against inputs and outputs, choose the buffer
    /// strategy and initialize.
    ///
    /// A node feeding more than one output renders through its summing buffer
    /// so later pulls in the same block reuse the rendered block.
    pub(crate) fn configure_connections(&self, graph: &mut GraphState) -> Result<()> {
        let inputs: Vec<NodeRef> = self.inputs.lock().values().cloned().collect();
        let mut in_place = inputs.len() <= 1 && self.outputs().len() <= 1;

        // Settle the width first so every input is checked against it.
        if self.channel_mode == ChannelMode::MatchesInput
            && inputs.iter().any(|n| !self.supports_input(n.num_channels()))
        {
            let widest = inputs.iter().map(|n| n.num_channels()).max().unwrap_or(1);
            self.set_num_channels(widest)?;
        }

        for input in &inputs {
            if !self.supports_input(input.num_channels()) {
                if input.channel_mode == ChannelMode::MatchesOutput {
                    input.set_num_channels(self.num_channels())?;
                    input.configure_connections(graph)?;
                }

                if !self.supports_input(input.num_channels()) {
                    let (from, to) = (input.num_channels(), self.num_channels());
                    if !dsp::channels_mixable(from, to) {
                        return Err(Error::IncompatibleChannels {
                            node: self.id,
                            input: input.id,
                            from,
                            to,
                        });
                    }
                    in_place = false;
                    input.set_process_with_summing()?;
                }
            }
            input.initialize_impl()?;
        }

        for output in self.outputs() {
            if output.supports_input(self.num_channels()) {
                continue;
            }
            if output.channel_mode == ChannelMode::MatchesInput {
                output.configure_connections(graph)?;
                if output.supports_input(self.num_channels()) {
                    continue;
                }
            }
            let (from, to) = (self.num_channels(), output.num_channels());
            if !dsp::channels_mixable(from, to) {
                return Err(Error::IncompatibleChannels {
                    node: output.id,
                    input: self.id,
                    from,
                    to,
                });
            }
            in_place = false;
        }

        self.process_in_place.store(in_place, Ordering::Release);
        if in_place {
            self.release_buffers();
        } else {
            self.allocate_buffers()?;
        }

        self.initialize_impl()
    }

    /// Renegotiate after this node's outputs changed.
    fn reconfigure(&self, graph: &mut GraphState) {
        if let Err(err) = self.configure_connections(graph) {
            warn!(node = %self, error = %err, "renegotiation after output change failed");
        }
    }

    fn supports_input(&self, input_channels: usize) -> bool {
        self.render
            .lock()
            .processor
            .supports_input_channels(input_channels, self.num_channels())
    }

    fn set_num_channels(&self, num_channels: usize) -> Result<()> {
        let num_channels = num_channels.max(1);
        if num_channels == self.num_channels() {
            return Ok(());
        }

        let was_initialized = self.is_initialized();
        if was_initialized {
            self.uninitialize_impl();
        }
        debug!(node = %self, from = self.num_channels(), to = num_channels, "channel count changed");
        self.num_channels.store(num_channels, Ordering::Release);

        if !self.process_in_place() {
            self.allocate_buffers()?;
        }
        if was_initialized {
            self.initialize_impl()?;
        }
        Ok(())
    }

    fn set_process_with_summing(&self) -> Result<()> {
        self.process_in_place.store(false, Ordering::Release);
        self.allocate_buffers()
    }

    fn allocate_buffers(&self) -> Result<()> {
        let frames = self.require_context()?.frames_per_block();
        let channels = self.num_channels();
        let mut render = self.render.lock();
        if render.internal.num_frames() != frames || render.internal.num_channels() != channels {
            render.internal.resize(frames, channels);
            render.summing.resize(frames, channels);
            self.rendered_frame.store(NOT_RENDERED, Ordering::Release);
        }
        Ok(())
    }

    fn release_buffers(&self) {
        let mut render = self.render.lock();
        render.internal = Buffer::default();
        render.summing = Buffer::default();
    }

    // ---- lifecycle ----

    /// Initialize this node if it is not already.
    pub fn initialize(&self) -> Result<()> {
        let context = self.require_context()?;
        let _graph = context.lock();
        self.initialize_impl()
    }

    /// Uninitialize this node if it is initialized.
    pub fn uninitialize(&self) -> Result<()> {
        let context = self.require_context()?;
        let _graph = context.lock();
        self.uninitialize_impl();
        Ok(())
    }

    pub(crate) fn initialize_impl(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let context = self.require_context()?;
        let init = InitContext {
            sample_rate: context.sample_rate(),
            frames_per_block: context.frames_per_block(),
            num_channels: self.num_channels(),
            node_id: self.id,
            context: self.context.clone(),
        };

        self.render.lock().processor.initialize(&init)?;
        for param in &self.params {
            param.bind(self.context.clone());
        }
        self.initialized.store(true, Ordering::Release);
        debug!(node = %self, channels = init.num_channels, "initialized");

        if self.is_auto_enabled() {
            self.start()?;
        }
        Ok(())
    }

    pub(crate) fn uninitialize_impl(&self) {
        if !self.is_initialized() {
            return;
        }
        if self.is_auto_enabled() {
            self.stop();
        }
        self.render.lock().processor.uninitialize();
        self.initialized.store(false, Ordering::Release);
        debug!(node = %self, "uninitialized");
    }

    /// Enable processing.
    pub fn start(&self) -> Result<()> {
        if self.is_enabled() {
            return Ok(());
        }
        self.render.lock().processor.start()?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Disable processing. The node keeps pulling its inputs.
    pub fn stop(&self) {
        if !self.is_enabled() {
            return;
        }
        self.enabled.store(false, Ordering::Release);
        self.render.lock().processor.stop();
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.start()
        } else {
            self.stop();
            Ok(())
        }
    }

    // ---- rendering ----

    /// Render one block of this node and everything upstream of it into
    /// `dest`.
    ///
    /// Normally only called by the context's render pass, which holds the
    /// context lock.
    pub fn pull_inputs(&self, dest: &mut Buffer) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        self.pull(dest, context.clock());
    }

    pub(crate) fn pull(&self, dest: &mut Buffer, clock: BlockClock) {
        let inputs = self.inputs.lock();
        let ctx = ProcessContext::new(
            clock.sample_rate,
            dest.num_frames(),
            clock.processed_frames,
            &self.enabled,
        );

        if self.process_in_place() {
            for input in inputs.values() {
                input.pull(dest, clock);
            }
            if self.is_enabled() {
                self.render.lock().processor.process(&ctx, dest);
            }
            return;
        }

        let mut render = self.render.lock();
        let RenderState {
            processor,
            internal,
            summing,
        } = &mut *render;

        // Already rendered for another output in this block.
        if self.rendered_frame.load(Ordering::Acquire) == clock.processed_frames {
            dsp::mix_into(summing, dest);
            return;
        }

        summing.zero();
        for input in inputs.values() {
            internal.zero();
            input.pull(internal, clock);
            dsp::sum_into(internal, summing);
        }
        if self.is_enabled() {
            processor.process(&ctx, summing);
        }
        self.rendered_frame
            .store(clock.processed_frames, Ordering::Release);
        dsp::mix_into(summing, dest);
    }
}

impl AsRef<Node> for Node {
    fn as_ref(&self) -> &Node {
        self
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id.0)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channels", &self.num_channels())
            .field("channel_mode", &self.channel_mode)
            .field("enabled", &self.is_enabled())
            .field("initialized", &self.is_initialized())
            .field("process_in_place", &self.process_in_place())
            .finish()
    }
}

/// A node in a graph plus the sending end of its message queue.
///
/// Returned by [`Context::make_node`]. Dereferences topology and lifecycle
/// calls to the underlying [`Node`].
pub struct NodeHandle<M: Send + 'static> {
    node: NodeRef,
    sender: Producer<M>,
}

impl<M: Send + 'static> NodeHandle<M> {
    pub(crate) fn new(node: NodeRef, sender: Producer<M>) -> Self {
        Self { node, sender }
    }

    /// Send a message to the node (applied at its next processed block).
    ///
    /// Returns the message back if the queue is full.
    pub fn send(&mut self, msg: M) -> core::result::Result<(), M> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }

    #[inline]
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn into_node(self) -> NodeRef {
        self.node
    }

    delegate! {
        to self.node {
            pub fn id(&self) -> NodeId;
            pub fn name(&self) -> &'static str;
            pub fn num_channels(&self) -> usize;
            pub fn channel_mode(&self) -> ChannelMode;
            pub fn is_enabled(&self) -> bool;
            pub fn is_initialized(&self) -> bool;
            pub fn is_auto_enabled(&self) -> bool;
            pub fn set_auto_enabled(&self, auto_enable: bool);
            pub fn max_inputs(&self) -> usize;
            pub fn params(&self) -> &[ParamRef];
            pub fn initialize(&self) -> Result<()>;
            pub fn uninitialize(&self) -> Result<()>;
            pub fn process_in_place(&self) -> bool;
            pub fn internal_buffer_frames(&self) -> usize;
            pub fn param(&self, name: &str) -> Option<ParamRef>;
            pub fn inputs(&self) -> Vec<(usize, NodeRef)>;
            pub fn input(&self, bus: usize) -> Option<NodeRef>;
            pub fn outputs(&self) -> Vec<NodeRef>;
            pub fn num_connected_inputs(&self) -> usize;
            pub fn has_outputs(&self) -> bool;
            pub fn is_connected_to_input<N: AsRef<Node> + ?Sized>(&self, node: &N) -> bool;
            pub fn is_connected_to_output<N: AsRef<Node> + ?Sized>(&self, node: &N) -> bool;
            pub fn connect<N: AsRef<Node> + ?Sized>(&self, dest: &N) -> Result<NodeRef>;
            pub fn connect_bus<N: AsRef<Node> + ?Sized>(&self, dest: &N, bus: usize) -> Result<NodeRef>;
            pub fn add_input<N: AsRef<Node> + ?Sized>(&self, input: &N) -> Result<usize>;
            pub fn set_input<N: AsRef<Node> + ?Sized>(&self, input: &N, bus: usize) -> Result<()>;
            pub fn disconnect(&self) -> Result<()>;
            pub fn disconnect_input(&self, bus: usize) -> Result<Option<NodeRef>>;
            pub fn disconnect_output<N: AsRef<Node> + ?Sized>(&self, output: &N) -> Result<()>;
            pub fn start(&self) -> Result<()>;
            pub fn stop(&self);
            pub fn set_enabled(&self, enabled: bool) -> Result<()>;
            pub fn pull_inputs(&self, dest: &mut Buffer);
        }
    }
}

impl<M: Send + 'static> AsRef<Node> for NodeHandle<M> {
    fn as_ref(&self) -> &Node {
        &self.node
    }
}

impl<M: Send + 'static> fmt::Debug for NodeHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeHandle").field(&*self.node).finish()
    }
}
