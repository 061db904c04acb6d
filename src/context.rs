//! Graph owner: render target, auto-pull registry and lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, MutexGuard};
use petgraph::dot::Dot;
use petgraph::graph::{Graph, NodeIndex};
use tracing::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::node::{AudioNode, BlockClock, Format, Node, NodeHandle, NodeId, NodeRef};

#[cfg(feature = "cpal_io")]
use crate::device::CpalDevice;

/// Default capacity of a node's message queue.
pub const DEFAULT_QUEUE_SIZE: usize = 64;

type ConnectionsListener = Arc<dyn Fn(&Node) + Send + Sync>;

/// Initial settings of a [`Context`].
///
/// A render target reporting a native rate or block size overrides these
/// when it is installed with [`Context::set_target`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextConfig {
    pub sample_rate: u32,
    pub frames_per_block: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frames_per_block: 512,
        }
    }
}

impl ContextConfig {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_frames_per_block(mut self, frames_per_block: usize) -> Self {
        self.frames_per_block = frames_per_block.max(1);
        self
    }
}

/// Graph state guarded by the context lock.
///
/// Holding a `&mut GraphState` is proof that the lock is held, so the
/// crate's topology internals take one as a parameter.
pub(crate) struct GraphState {
    target: Option<NodeRef>,
    target_buffer: Buffer,
    frames_per_block: usize,

    auto_pulled: HashMap<NodeId, NodeRef>,
    auto_pull_cache: Vec<NodeRef>,
    auto_pull_cache_dirty: bool,
    auto_pull_buffer: Buffer,
}

impl GraphState {
    pub(crate) fn add_auto_pulled(&mut self, node: &NodeRef) {
        if self.auto_pulled.insert(node.id(), node.clone()).is_none() {
            self.auto_pull_cache_dirty = true;
            // The cache is rebuilt on the render thread, which must not grow it.
            self.auto_pull_cache.reserve(self.auto_pulled.len());
            self.reserve_auto_pull_buffer();
            trace!(node = %node, "auto-pull registered");
        }
    }

    /// Size the auto-pull scratch buffer for the widest auto-pulled node.
    fn reserve_auto_pull_buffer(&mut self) {
        let widest = self
            .auto_pulled
            .values()
            .map(|node| node.num_channels())
            .max()
            .unwrap_or(0);
        self.auto_pull_buffer.reserve(self.frames_per_block, widest);
    }

    pub(crate) fn remove_auto_pulled(&mut self, node: &Node) {
        if self.auto_pulled.remove(&node.id()).is_some() {
            self.auto_pull_cache_dirty = true;
            trace!(node = %node, "auto-pull unregistered");
        }
    }

    /// Keep an auto-pullable node registered exactly while it has no outputs.
    pub(crate) fn update_auto_pull(&mut self, node: &NodeRef) {
        if !node.is_auto_pullable() {
            return;
        }
        if node.has_outputs() {
            self.remove_auto_pulled(node);
        } else {
            self.add_auto_pulled(node);
        }
    }

    /// Match the render buffers to the current channel counts. Called after
    /// every negotiation, since it can change any node's width.
    pub(crate) fn refresh_buffers(&mut self) {
        self.reserve_auto_pull_buffer();
        let Some(target) = &self.target else {
            return;
        };
        let channels = target.num_channels();
        if self.target_buffer.num_frames() != self.frames_per_block
            || self.target_buffer.num_channels() != channels
        {
            self.target_buffer.resize(self.frames_per_block, channels);
        }
    }

    fn pull_auto_pulled(&mut self, clock: BlockClock) {
        if self.auto_pull_cache_dirty {
            // Reuses the cache's allocation.
            self.auto_pull_cache.clear();
            self.auto_pull_cache.extend(self.auto_pulled.values().cloned());
            self.auto_pull_cache.sort_unstable_by_key(|node| node.id());
            self.auto_pull_cache_dirty = false;
        }

        for node in &self.auto_pull_cache {
            self.auto_pull_buffer
                .resize(self.frames_per_block, node.num_channels());
            node.pull(&mut self.auto_pull_buffer, clock);
        }
    }
}

/// Owner of an audio graph.
///
/// A context holds the render target, the auto-pull registry and the single
/// lock that serializes topology changes against the render pass. Nodes are
/// created through it and keep a weak reference back to it.
///
/// # Lifecycle
///
/// ```text
/// uninitialized --initialize()--> initialized --start()--> running
///       ^                              |   ^                  |
///       +-------uninitialize()---------+   +------stop()------+
/// ```
///
/// Calling `start` or `stop` when already in that state does nothing.
///
/// # Example
///
/// ```
/// use klanggraph::{Context, ContextConfig};
/// use klanggraph::nodes::{NullOutput, Sine};
///
/// let ctx = Context::new(ContextConfig::default().with_frames_per_block(128));
/// let out = ctx.make_node(NullOutput::new());
/// ctx.set_target(&out).unwrap();
///
/// let sine = ctx.make_node(Sine::new(440.0));
/// sine.connect(&out).unwrap();
/// sine.start().unwrap();
///
/// ctx.initialize().unwrap();
/// ctx.start().unwrap();
///
/// let peak = ctx
///     .render_block(|block| block.channel(0).iter().fold(0.0f32, |m, s| m.max(s.abs())))
///     .unwrap();
/// assert!(peak > 0.0);
/// assert_eq!(ctx.processed_frames(), 128);
/// ```
pub struct Context {
    self_ref: Weak<Context>,
    graph: Mutex<GraphState>,

    sample_rate: AtomicU32,
    frames_per_block: AtomicUsize,
    processed_frames: AtomicU64,
    initialized: AtomicBool,
    running: AtomicBool,
    next_node_id: AtomicU32,

    listener: Mutex<Option<ConnectionsListener>>,
}

impl Context {
    pub fn new(config: ContextConfig) -> Arc<Context> {
        let frames_per_block = config.frames_per_block.max(1);
        Arc::new_cyclic(|self_ref| Context {
            self_ref: self_ref.clone(),
            graph: Mutex::new(GraphState {
                target: None,
                target_buffer: Buffer::default(),
                frames_per_block,
                auto_pulled: HashMap::new(),
                auto_pull_cache: Vec::new(),
                auto_pull_cache_dirty: false,
                auto_pull_buffer: Buffer::default(),
            }),
            sample_rate: AtomicU32::new(config.sample_rate),
            frames_per_block: AtomicUsize::new(frames_per_block),
            processed_frames: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            next_node_id: AtomicU32::new(0),
            listener: Mutex::new(None),
        })
    }

    /// Create a context rendering to the system's default output device.
    ///
    /// The context adopts the device's rate and block size; the line-out
    /// node is installed as the target.
    ///
    /// ```no_run
    /// use klanggraph::Context;
    ///
    /// let ctx = Context::with_default_output().expect("no audio device");
    /// ctx.initialize().unwrap();
    /// ctx.start().unwrap();
    /// ```
    #[cfg(feature = "cpal_io")]
    pub fn with_default_output() -> Result<Arc<Context>> {
        let device = CpalDevice::default_output()
            .ok_or_else(|| Error::Device("no default output device".into()))?;
        let ctx = Context::new(
            ContextConfig::default()
                .with_sample_rate(device.sample_rate())
                .with_frames_per_block(device.frames_per_block()),
        );
        let out = ctx.make_node(device.create_line_out());
        ctx.set_target(&out)?;
        Ok(ctx)
    }

    /// Acquire the graph lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.graph.lock()
    }

    // ---- node creation ----

    /// Add a node to this context with its default format.
    pub fn make_node<N: AudioNode>(&self, node: N) -> NodeHandle<N::Message> {
        self.create_node(node, Format::default(), DEFAULT_QUEUE_SIZE)
    }

    /// Add a node with an explicit format.
    ///
    /// ```
    /// use klanggraph::{Context, ContextConfig, Format};
    /// use klanggraph::nodes::Gain;
    ///
    /// let ctx = Context::new(ContextConfig::default());
    /// let gain = ctx.make_node_with_format(Gain::new(1.0), Format::new().channels(2));
    /// assert_eq!(gain.num_channels(), 2);
    /// ```
    pub fn make_node_with_format<N: AudioNode>(
        &self,
        node: N,
        format: Format,
    ) -> NodeHandle<N::Message> {
        self.create_node(node, format, DEFAULT_QUEUE_SIZE)
    }

    /// Add a node with a custom message queue size.
    pub fn make_node_with_queue_size<N: AudioNode>(
        &self,
        node: N,
        queue_size: usize,
    ) -> NodeHandle<N::Message> {
        self.create_node(node, Format::default(), queue_size)
    }

    fn create_node<N: AudioNode>(
        &self,
        node: N,
        format: Format,
        queue_size: usize,
    ) -> NodeHandle<N::Message> {
        let id = NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed));
        let (node, sender) = Node::create(id, self.self_ref.clone(), node, format, queue_size);
        debug!(node = %node, channels = node.num_channels(), "created");

        if node.is_auto_pullable() {
            let mut graph = self.lock();
            graph.update_auto_pull(&node);
            if self.is_initialized() {
                if let Err(err) = node.initialize_impl() {
                    warn!(node = %node, error = %err, "initialization failed");
                }
            }
        }

        NodeHandle::new(node, sender)
    }

    // ---- target ----

    /// Install the terminal render node.
    ///
    /// If the target reports a native sample rate or block size, the context
    /// adopts them. Install the target before building the rest of the graph
    /// so node buffers are sized for the final block size.
    pub fn set_target<N: AsRef<Node> + ?Sized>(&self, target: &N) -> Result<()> {
        let target = target.as_ref();
        if !target.belongs_to(self) {
            return Err(Error::ContextMismatch);
        }
        let target = target.shared()?;

        let mut graph = self.lock();
        if let Some(rate) = target.native_sample_rate() {
            self.sample_rate.store(rate, Ordering::Release);
        }
        if let Some(frames) = target.native_frames_per_block() {
            let frames = frames.max(1);
            self.frames_per_block.store(frames, Ordering::Release);
            graph.frames_per_block = frames;
        }

        debug!(
            target = %target,
            sample_rate = self.sample_rate(),
            frames_per_block = self.frames_per_block(),
            "target set"
        );
        graph.target = Some(target);
        graph.refresh_buffers();
        Ok(())
    }

    pub fn target(&self) -> Option<NodeRef> {
        self.lock().target.clone()
    }

    // ---- lifecycle ----

    /// Initialize every node reachable from the target or registered for
    /// auto-pull.
    pub fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        {
            let mut graph = self.lock();
            if graph.target.is_none() {
                return Err(Error::NoTarget);
            }
            Self::initialize_locked(&mut graph)?;
        }
        self.initialized.store(true, Ordering::Release);
        debug!("context initialized");
        Ok(())
    }

    /// Stop if running, then uninitialize every node.
    pub fn uninitialize(&self) {
        if !self.is_initialized() {
            return;
        }
        self.stop();
        {
            let graph = self.lock();
            Self::uninitialize_locked(&graph);
        }
        self.initialized.store(false, Ordering::Release);
        debug!("context uninitialized");
    }

    /// Begin rendering.
    ///
    /// Starts the target node, which for device-backed targets starts the
    /// hardware stream. Fails if the context is not initialized.
    pub fn start(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if self.is_enabled() {
            return Ok(());
        }
        let target = self.target().ok_or(Error::NoTarget)?;

        self.running.store(true, Ordering::Release);
        // The backend may call `render_block` before this returns, so the
        // graph lock must not be held here.
        if let Err(err) = target.start() {
            self.running.store(false, Ordering::Release);
            return Err(err);
        }
        debug!(target = %target, "context started");
        Ok(())
    }

    /// Stop rendering. Backend threads are signalled, never joined.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(target) = self.target() {
            target.stop();
        }
        debug!("context stopped");
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.start()
        } else {
            self.stop();
            Ok(())
        }
    }

    /// Whether the context is running.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    #[inline]
    pub fn frames_per_block(&self) -> usize {
        self.frames_per_block.load(Ordering::Acquire)
    }

    /// Frames rendered since the context was created.
    #[inline]
    pub fn processed_frames(&self) -> u64 {
        self.processed_frames.load(Ordering::Acquire)
    }

    pub fn processed_seconds(&self) -> f64 {
        self.processed_frames() as f64 / self.sample_rate().max(1) as f64
    }

    pub(crate) fn clock(&self) -> BlockClock {
        BlockClock {
            sample_rate: self.sample_rate(),
            processed_frames: self.processed_frames(),
        }
    }

    // ---- whole-graph traversal ----

    /// Initialize every node reachable from the target, inputs first.
    pub fn initialize_all_nodes(&self) -> Result<()> {
        let mut graph = self.lock();
        Self::initialize_locked(&mut graph)
    }

    /// Uninitialize every node reachable from the target.
    pub fn uninitialize_all_nodes(&self) {
        let graph = self.lock();
        Self::uninitialize_locked(&graph);
    }

    fn roots(graph: &GraphState) -> Vec<NodeRef> {
        graph
            .target
            .iter()
            .chain(graph.auto_pulled.values())
            .cloned()
            .collect()
    }

    fn initialize_locked(graph: &mut GraphState) -> Result<()> {
        fn visit(node: &NodeRef, seen: &mut HashSet<NodeId>) -> Result<()> {
            if !seen.insert(node.id()) {
                return Ok(());
            }
            for (_, input) in node.inputs() {
                visit(&input, seen)?;
            }
            node.initialize_impl()
        }

        let mut seen = HashSet::new();
        for root in Self::roots(graph) {
            visit(&root, &mut seen)?;
        }
        graph.refresh_buffers();
        Ok(())
    }

    fn uninitialize_locked(graph: &GraphState) {
        fn visit(node: &NodeRef, seen: &mut HashSet<NodeId>) {
            if !seen.insert(node.id()) {
                return;
            }
            for (_, input) in node.inputs() {
                visit(&input, seen);
            }
            node.uninitialize_impl();
        }

        let mut seen = HashSet::new();
        for root in Self::roots(graph) {
            visit(&root, &mut seen);
        }
    }

    /// Disconnect every node reachable from the target, target first.
    pub fn disconnect_all_nodes(&self) {
        fn visit(graph: &mut GraphState, node: &NodeRef, touched: &mut Vec<NodeRef>) {
            let inputs = node.inputs();
            node.disconnect_locked(graph);
            touched.push(node.clone());
            for (_, input) in &inputs {
                visit(graph, input, touched);
            }
        }

        let mut touched = Vec::new();
        {
            let mut graph = self.lock();
            if let Some(target) = graph.target.clone() {
                visit(&mut graph, &target, &mut touched);
            }
        }
        for node in &touched {
            self.connections_did_change(node);
        }
    }

    // ---- auto-pull ----

    /// Render `node` every block even though nothing consumes its output.
    pub fn add_auto_pulled_node<N: AsRef<Node> + ?Sized>(&self, node: &N) -> Result<()> {
        let node = node.as_ref();
        if !node.belongs_to(self) {
            return Err(Error::ContextMismatch);
        }
        let node = node.shared()?;
        self.lock().add_auto_pulled(&node);
        Ok(())
    }

    pub fn remove_auto_pulled_node<N: AsRef<Node> + ?Sized>(&self, node: &N) {
        self.lock().remove_auto_pulled(node.as_ref());
    }

    pub fn auto_pulled_nodes(&self) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = self.lock().auto_pulled.values().cloned().collect();
        nodes.sort_unstable_by_key(|node| node.id());
        nodes
    }

    // ---- rendering ----

    /// Run one render pass and hand the target's block to `f`.
    ///
    /// Pulls the target, then every auto-pulled node, then advances the
    /// frame clock by one block. Returns `None` without rendering unless the
    /// context is initialized and running. Called by device backends from
    /// their callback thread, and directly by tests and offline drivers.
    pub fn render_block<R>(&self, f: impl FnOnce(&Buffer) -> R) -> Option<R> {
        if !self.is_initialized() || !self.is_enabled() {
            return None;
        }

        let mut graph = self.lock();
        let clock = self.clock();

        let state = &mut *graph;
        let target = state.target.as_ref()?;
        state.target_buffer.zero();
        target.pull(&mut state.target_buffer, clock);
        state.pull_auto_pulled(clock);

        let result = f(&state.target_buffer);
        self.processed_frames
            .fetch_add(state.target_buffer.num_frames() as u64, Ordering::AcqRel);
        Some(result)
    }

    // ---- notifications ----

    /// Install a callback invoked after every topology change, outside the
    /// graph lock.
    pub fn set_connections_listener(&self, listener: impl Fn(&Node) + Send + Sync + 'static) {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    pub fn clear_connections_listener(&self) {
        *self.listener.lock() = None;
    }

    pub(crate) fn connections_did_change(&self, node: &Node) {
        trace!(node = %node, "connections changed");
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(node);
        }
    }

    // ---- diagnostics ----

    /// Snapshot of the graph reachable from the target and the auto-pulled
    /// nodes. Edge weights are input bus indices.
    pub fn graph_snapshot(&self) -> Graph<String, usize> {
        fn visit(
            node: &NodeRef,
            out: &mut Graph<String, usize>,
            indices: &mut HashMap<NodeId, NodeIndex>,
        ) -> NodeIndex {
            if let Some(index) = indices.get(&node.id()) {
                return *index;
            }
            let index = out.add_node(format!("{} ({}ch)", node, node.num_channels()));
            indices.insert(node.id(), index);
            for (bus, input) in node.inputs() {
                let from = visit(&input, out, indices);
                out.add_edge(from, index, bus);
            }
            index
        }

        let roots = Self::roots(&self.lock());
        let mut out = Graph::new();
        let mut indices = HashMap::new();
        for root in &roots {
            visit(root, &mut out, &mut indices);
        }
        out
    }

    /// The graph as Graphviz dot text.
    pub fn print_graph(&self) -> String {
        format!("{}", Dot::new(&self.graph_snapshot()))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(target) = self.graph.get_mut().target.take() {
            target.stop();
        }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("sample_rate", &self.sample_rate())
            .field("frames_per_block", &self.frames_per_block())
            .field("processed_frames", &self.processed_frames())
            .field("initialized", &self.is_initialized())
            .field("running", &self.is_enabled())
            .finish()
    }
}
