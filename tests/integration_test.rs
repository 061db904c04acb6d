use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use klanggraph::nodes::{BufferPlayer, Callback, Gain, Mixer, Monitor, NullOutput, Silence, Sine};
use klanggraph::{
    AudioNode, Buffer, ChannelMode, Context, ContextConfig, Error, Format, NodeHandle,
    ProcessContext,
};

/// Constant-level source, enabled as soon as it is initialized.
struct Dc(f32);

impl AudioNode for Dc {
    type Message = f32;

    fn process(&mut self, _ctx: &ProcessContext, messages: impl Iterator<Item = f32>, buffer: &mut Buffer) {
        if let Some(level) = messages.last() {
            self.0 = level;
        }
        buffer.fill(self.0);
    }

    fn name(&self) -> &'static str {
        "Dc"
    }

    fn default_format(&self) -> Format {
        Format::new().channels(1).auto_enable(true)
    }

    fn num_inputs(&self) -> usize {
        0
    }
}

fn setup() -> (Arc<Context>, NodeHandle<()>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let ctx = Context::new(
        ContextConfig::default()
            .with_sample_rate(8)
            .with_frames_per_block(4),
    );
    let out = ctx.make_node(NullOutput::new());
    ctx.set_target(&out).unwrap();
    (ctx, out)
}

fn run(ctx: &Context) {
    ctx.initialize().unwrap();
    ctx.start().unwrap();
}

fn render(ctx: &Context) -> Buffer {
    ctx.render_block(|block| block.clone()).expect("context is running")
}

#[test]
fn mono_source_is_broadcast_to_stereo_target() {
    let (ctx, out) = setup();
    let dc = ctx.make_node(Dc(0.5));
    dc.connect(&out).unwrap();
    run(&ctx);

    let block = render(&ctx);
    assert_eq!(block.num_channels(), 2);
    assert_eq!(block.channel(0), &[0.5; 4]);
    assert_eq!(block.channel(1), &[0.5; 4]);
    assert!(!dc.process_in_place());
}

#[test]
fn matching_chain_renders_in_place() {
    let (ctx, out) = setup();
    let sine = ctx.make_node_with_format(Sine::new(1.0), Format::new().channels(2));
    let gain = ctx.make_node(Gain::new(0.5));
    sine.connect(&gain).unwrap().connect(&out).unwrap();

    assert_eq!(gain.num_channels(), 2);
    assert_eq!(gain.channel_mode(), ChannelMode::MatchesInput);
    assert!(sine.process_in_place());
    assert!(gain.process_in_place());
    assert_eq!(gain.internal_buffer_frames(), 0);
}

#[test]
fn mixer_sums_its_inputs() {
    let (ctx, out) = setup();
    let a = ctx.make_node(Dc(0.25));
    let b = ctx.make_node(Dc(0.5));
    let mixer = ctx.make_node(Mixer::stereo());
    a.connect(&mixer).unwrap();
    b.connect(&mixer).unwrap();
    mixer.connect(&out).unwrap();
    run(&ctx);

    assert!(!mixer.process_in_place());
    assert_eq!(mixer.num_connected_inputs(), 2);
    let block = render(&ctx);
    assert_eq!(block.channel(0), &[0.75; 4]);
    assert_eq!(block.channel(1), &[0.75; 4]);
}

#[test]
fn disabled_node_passes_input_through() {
    let (ctx, out) = setup();
    let dc = ctx.make_node(Dc(0.5));
    let gain = ctx.make_node(Gain::new(0.5));
    dc.connect(&gain).unwrap().connect(&out).unwrap();
    run(&ctx);

    assert!(gain.is_enabled());
    assert_eq!(render(&ctx).channel(0), &[0.25; 4]);

    gain.stop();
    assert_eq!(render(&ctx).channel(0), &[0.5; 4]);
}

#[test]
fn sources_are_silent_until_started() {
    let (ctx, out) = setup();
    let sine = ctx.make_node(Sine::new(1.0).with_amplitude(1.0));
    sine.connect(&out).unwrap();
    run(&ctx);

    assert!(render(&ctx).data().iter().all(|s| *s == 0.0));
    sine.start().unwrap();
    // sin(2π · 2/8) = 1
    assert_relative_eq!(render(&ctx).channel(0)[2], 1.0, epsilon = 1e-5);
}

#[test]
fn messages_reach_the_audio_thread() {
    let (ctx, out) = setup();
    let mut dc = ctx.make_node(Dc(0.5));
    dc.connect(&out).unwrap();
    run(&ctx);

    dc.send(0.125).unwrap();
    assert_eq!(render(&ctx).channel(1), &[0.125; 4]);
}

#[test]
fn frame_clock_advances_per_block() {
    let (ctx, _out) = setup();
    assert!(ctx.render_block(|_| ()).is_none());
    assert!(matches!(ctx.start(), Err(Error::NotInitialized)));

    run(&ctx);
    render(&ctx);
    render(&ctx);
    assert_eq!(ctx.processed_frames(), 8);
    assert_relative_eq!(ctx.processed_seconds(), 1.0);

    ctx.stop();
    assert!(ctx.render_block(|_| ()).is_none());
}

#[test]
fn initialize_requires_a_target() {
    let ctx = Context::new(ContextConfig::default());
    assert!(matches!(ctx.initialize(), Err(Error::NoTarget)));
}

#[test]
fn invalid_connections_are_rejected() {
    let (ctx, out) = setup();
    let sine = ctx.make_node(Sine::new(1.0));
    let a = ctx.make_node(Gain::new(1.0));
    let b = ctx.make_node(Gain::new(1.0));

    assert!(matches!(a.connect(&a), Err(Error::SelfConnection(_))));
    assert!(matches!(a.connect(&sine), Err(Error::NoInputBusses(_))));
    assert!(matches!(out.connect(&a), Err(Error::NoOutputs(_))));

    a.connect(&b).unwrap();
    assert!(matches!(a.connect(&b), Err(Error::DuplicateInput { .. })));
    assert!(matches!(b.connect(&a), Err(Error::Cycle { .. })));

    assert!(matches!(
        sine.connect_bus(&a, 1),
        Err(Error::BusOutOfRange { bus: 1, max: 1, .. })
    ));
    sine.connect_bus(&a, 0).unwrap();
    let other = ctx.make_node(Sine::new(2.0));
    assert!(matches!(other.connect_bus(&a, 0), Err(Error::BusOccupied { bus: 0, .. })));
    assert!(matches!(other.connect(&a), Err(Error::NoFreeBus(_))));
}

#[test]
fn nodes_of_different_contexts_do_not_connect() {
    let (ctx, _out) = setup();
    let (other_ctx, other_out) = setup();
    let sine = ctx.make_node(Sine::new(1.0));

    assert!(matches!(sine.connect(&other_out), Err(Error::ContextMismatch)));
    assert!(matches!(other_ctx.set_target(&sine), Err(Error::ContextMismatch)));
}

#[test]
fn incompatible_channels_roll_back_the_edge() {
    let (ctx, _out) = setup();
    let stereo = ctx.make_node_with_format(Dc(1.0), Format::new().channels(2));
    let mixer = ctx.make_node(Mixer::new(3));

    let err = stereo.connect(&mixer).unwrap_err();
    assert!(matches!(err, Error::IncompatibleChannels { from: 2, to: 3, .. }));
    assert_eq!(mixer.num_connected_inputs(), 0);
    assert!(stereo.outputs().is_empty());
}

#[test]
fn matches_output_adopts_downstream_width() {
    let (ctx, out) = setup();
    let dc = ctx.make_node_with_format(
        Dc(1.0),
        Format::new().channel_mode(ChannelMode::MatchesOutput),
    );
    dc.connect(&out).unwrap();
    assert_eq!(dc.num_channels(), 2);
    assert!(dc.process_in_place());
}

#[test]
fn disconnecting_silences_the_target() {
    let (ctx, out) = setup();
    let dc = ctx.make_node(Dc(1.0));
    let gain = ctx.make_node(Gain::new(1.0));
    dc.connect(&gain).unwrap().connect(&out).unwrap();
    run(&ctx);
    assert_eq!(render(&ctx).channel(0), &[1.0; 4]);

    let removed = out.disconnect_input(0).unwrap().unwrap();
    assert_eq!(removed.id(), gain.id());
    assert!(!gain.has_outputs());
    assert!(render(&ctx).data().iter().all(|s| *s == 0.0));

    gain.connect(&out).unwrap();
    dc.disconnect_output(&gain).unwrap();
    assert_eq!(gain.num_connected_inputs(), 0);
    assert!(render(&ctx).data().iter().all(|s| *s == 0.0));
}

#[test]
fn inputs_stay_alive_without_handles() {
    let (ctx, out) = setup();
    {
        let dc = ctx.make_node(Dc(0.5));
        let gain = ctx.make_node(Gain::new(2.0));
        dc.connect(&gain).unwrap().connect(&out).unwrap();
    }
    run(&ctx);
    assert_eq!(render(&ctx).channel(0), &[1.0; 4]);

    ctx.disconnect_all_nodes();
    assert_eq!(out.num_connected_inputs(), 0);
    assert!(render(&ctx).data().iter().all(|s| *s == 0.0));
}

#[test]
fn monitors_are_auto_pulled_while_unconnected() {
    let (ctx, out) = setup();
    let dc = ctx.make_node(Dc(0.5));
    let (monitor, mut reader) = Monitor::new(4);
    let monitor = ctx.make_node(monitor);
    dc.connect(&monitor).unwrap();
    run(&ctx);

    let pulled = ctx.auto_pulled_nodes();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].id(), monitor.id());

    render(&ctx);
    reader.update();
    assert_eq!(reader.num_channels(), 1);
    assert_eq!(reader.channel(0), &[0.5; 4]);
    assert_relative_eq!(reader.volume(), 0.5);

    monitor.connect(&out).unwrap();
    assert!(ctx.auto_pulled_nodes().is_empty());
    assert_eq!(render(&ctx).channel(1), &[0.5; 4]);

    monitor.disconnect().unwrap();
    assert_eq!(ctx.auto_pulled_nodes().len(), 1);
}

#[test]
fn listener_sees_topology_changes() {
    let (ctx, out) = setup();
    let changes = Arc::new(AtomicUsize::new(0));
    let seen = changes.clone();
    ctx.set_connections_listener(move |_node| {
        seen.fetch_add(1, Ordering::AcqRel);
    });

    let sine = ctx.make_node(Sine::new(1.0));
    sine.connect(&out).unwrap();
    assert_eq!(changes.load(Ordering::Acquire), 1);

    out.disconnect_input(0).unwrap();
    assert_eq!(changes.load(Ordering::Acquire), 2);

    ctx.clear_connections_listener();
    sine.connect(&out).unwrap();
    assert_eq!(changes.load(Ordering::Acquire), 2);
}

#[test]
fn gain_ramp_is_sample_accurate() {
    let (ctx, out) = setup();
    let dc = ctx.make_node(Dc(1.0));
    let gain = ctx.make_node(Gain::new(1.0));
    dc.connect(&gain).unwrap().connect(&out).unwrap();
    run(&ctx);

    // Half a second at 8 Hz is one block.
    gain.param("gain").unwrap().ramp_to(0.0, 0.5).unwrap();
    assert_eq!(render(&ctx).channel(0), &[1.0, 0.75, 0.5, 0.25]);
    assert_eq!(render(&ctx).channel(0), &[0.0; 4]);
    assert_eq!(gain.param("gain").unwrap().value(), 0.0);
}

#[test]
fn graph_prints_as_dot() {
    let (ctx, out) = setup();
    let sine = ctx.make_node(Sine::new(1.0));
    sine.connect(&out).unwrap();

    let snapshot = ctx.graph_snapshot();
    assert_eq!(snapshot.node_count(), 2);
    assert_eq!(snapshot.edge_count(), 1);
    let dot = ctx.print_graph();
    assert!(dot.contains("Sine"));
    assert!(dot.contains("NullOutput"));
}

#[test]
fn stereo_source_into_stereo_target_stays_in_place() {
    let (ctx, out) = setup();
    let silence = ctx.make_node_with_format(Silence::new(), Format::new().channels(2));
    silence.connect(&out).unwrap();

    assert!(silence.process_in_place());
    assert!(out.process_in_place());
    assert_eq!(silence.internal_buffer_frames(), 0);
    assert_eq!(out.internal_buffer_frames(), 0);
}

#[test]
fn stopped_player_does_not_advance() {
    let (ctx, out) = setup();
    let player = BufferPlayer::new(Buffer::from_channels(&[vec![0.5; 16]]));
    let status = player.status();
    let player = ctx.make_node(player);
    player.connect(&out).unwrap();
    player.start().unwrap();
    run(&ctx);

    render(&ctx);
    assert_eq!(status.position(), 4);

    player.stop();
    assert!(render(&ctx).data().iter().all(|s| *s == 0.0));
    assert_eq!(status.position(), 4);

    // Starting again rewinds.
    player.start().unwrap();
    assert_eq!(status.position(), 0);
    render(&ctx);
    assert_eq!(status.position(), 4);
}

#[test]
fn disconnecting_the_last_owner_while_running_is_safe() {
    let (ctx, out) = setup();
    {
        let sine = ctx.make_node(Sine::new(1.0));
        sine.connect(&out).unwrap();
        sine.start().unwrap();
    }
    let (monitor, _reader) = Monitor::new(4);
    let monitor = ctx.make_node(monitor);
    run(&ctx);
    render(&ctx);

    let sine = out.input(0).unwrap();
    sine.connect(&monitor).unwrap();
    drop(sine);

    // Afterwards the monitor holds the only reference to the sine.
    out.disconnect().unwrap();
    assert!(render(&ctx).data().iter().all(|s| *s == 0.0));

    monitor.disconnect().unwrap();
    render(&ctx);
    assert_eq!(monitor.num_connected_inputs(), 0);
}

fn ramp_player(frames: usize) -> BufferPlayer {
    BufferPlayer::new(Buffer::from_channels(&[(0..frames).map(|i| i as f32).collect()]))
}

fn passthrough() -> Callback<impl FnMut(&ProcessContext, &mut Buffer) + Send + 'static> {
    Callback::new(|_ctx: &ProcessContext, _buffer: &mut Buffer| {})
}

#[test]
fn fan_out_source_renders_once_per_block() {
    let (ctx, out) = setup();
    let player = ramp_player(64);
    let status = player.status();
    let player = ctx.make_node(player);
    let left = ctx.make_node(Gain::new(1.0));
    let right = ctx.make_node(Gain::new(1.0));
    let mixer = ctx.make_node(Mixer::mono());
    player.connect(&left).unwrap().connect(&mixer).unwrap();
    player.connect(&right).unwrap().connect(&mixer).unwrap();
    mixer.connect(&out).unwrap();
    player.start().unwrap();
    run(&ctx);

    assert!(!player.process_in_place());
    assert!(left.process_in_place());
    assert!(right.process_in_place());

    let block = render(&ctx);
    assert_eq!(block.channel(0), &[0.0, 2.0, 4.0, 6.0]);
    assert_eq!(status.position(), 4);

    let block = render(&ctx);
    assert_eq!(block.channel(0), &[8.0, 10.0, 12.0, 14.0]);
    assert_eq!(status.position(), 8);
}

#[test]
fn target_and_monitor_share_one_render() {
    let (ctx, out) = setup();
    let player = ramp_player(64);
    let status = player.status();
    let player = ctx.make_node(player);
    let (monitor, mut reader) = Monitor::new(4);
    let monitor = ctx.make_node(monitor);
    player.connect(&out).unwrap();
    player.connect(&monitor).unwrap();
    player.start().unwrap();
    run(&ctx);

    let block = render(&ctx);
    assert_eq!(block.channel(0), &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(block.channel(1), &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(status.position(), 4);

    reader.update();
    assert_eq!(reader.channel(0), &[0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn dropping_fan_out_returns_to_in_place() {
    let (ctx, out) = setup();
    let dc = ctx.make_node_with_format(Dc(0.5), Format::new().channels(2));
    let gain = ctx.make_node(Gain::new(1.0));
    dc.connect(&out).unwrap();
    dc.connect(&gain).unwrap();
    assert!(!dc.process_in_place());

    dc.disconnect_output(&gain).unwrap();
    assert!(dc.process_in_place());
    assert_eq!(dc.internal_buffer_frames(), 0);
    run(&ctx);
    assert_eq!(render(&ctx).channel(1), &[0.5; 4]);
}

#[test]
fn widest_input_is_adopted_and_narrow_inputs_are_upmixed() {
    let (ctx, out) = setup();
    let mono = ctx.make_node(Dc(0.25));
    let stereo = ctx.make_node_with_format(Dc(0.5), Format::new().channels(2));
    let tap = ctx.make_node(passthrough());
    tap.connect(&out).unwrap();
    mono.connect(&tap).unwrap();
    assert_eq!(tap.num_channels(), 1);

    stereo.connect(&tap).unwrap();
    assert_eq!(tap.num_channels(), 2);
    assert!(!mono.process_in_place());
    assert!(stereo.process_in_place());
    assert!(!tap.process_in_place());
    run(&ctx);

    let block = render(&ctx);
    assert_eq!(block.channel(0), &[0.75; 4]);
    assert_eq!(block.channel(1), &[0.75; 4]);
}

#[test]
fn widening_pushes_channel_count_to_matching_outputs() {
    let (ctx, out) = setup();
    let mono = ctx.make_node(Dc(0.25));
    let stereo = ctx.make_node_with_format(Dc(0.5), Format::new().channels(2));
    let tap = ctx.make_node(passthrough());
    let gain = ctx.make_node(Gain::new(0.5));
    tap.connect(&gain).unwrap().connect(&out).unwrap();
    mono.connect(&tap).unwrap();
    assert_eq!(gain.num_channels(), 1);
    assert!(!gain.process_in_place());

    stereo.connect(&tap).unwrap();
    assert_eq!(tap.num_channels(), 2);
    assert_eq!(gain.num_channels(), 2);
    assert!(gain.process_in_place());
    run(&ctx);

    let block = render(&ctx);
    assert_eq!(block.channel(0), &[0.375; 4]);
    assert_eq!(block.channel(1), &[0.375; 4]);
}
