use std::sync::Arc;

use klanggraph::nodes::{Gain, NullOutput};
use klanggraph::{Context, ContextConfig, Error, ParamRef};

/// A running context at 8 Hz with 4-frame blocks and a connected gain whose
/// param is bound to the context's clock.
fn bound_param() -> (Arc<Context>, ParamRef) {
    let ctx = Context::new(
        ContextConfig::default()
            .with_sample_rate(8)
            .with_frames_per_block(4),
    );
    let out = ctx.make_node(NullOutput::new());
    ctx.set_target(&out).unwrap();
    let gain = ctx.make_node(Gain::new(1.0));
    gain.connect(&out).unwrap();
    ctx.initialize().unwrap();
    ctx.start().unwrap();
    let param = gain.param("gain").unwrap();
    (ctx, param)
}

#[test]
fn unbound_param_cannot_ramp() {
    let param = klanggraph::Param::new("level", 0.5);
    assert!(!param.is_bound());
    assert!(matches!(param.ramp_to(1.0, 1.0), Err(Error::ParamUnbound("level"))));

    param.set_value(0.75);
    assert_eq!(param.value(), 0.75);
}

#[test]
fn ramp_starts_at_the_current_frame_and_holds_outside() {
    let (ctx, param) = bound_param();
    ctx.render_block(|_| ());
    assert_eq!(ctx.processed_frames(), 4);

    param.ramp_to(0.0, 0.5).unwrap();
    let event = param.event().unwrap();
    assert_eq!((event.begin_frame, event.end_frame), (4, 8));
    assert!(param.is_varying_next_eval());

    let mut out = [0.0; 12];
    param.eval(0, 12, &mut out, 8);
    assert_eq!(&out[..4], &[1.0; 4]);
    assert_eq!(&out[4..8], &[1.0, 0.75, 0.5, 0.25]);
    assert_eq!(&out[8..], &[0.0; 4]);

    assert!(param.event().is_none());
    assert_eq!(param.value(), 0.0);
    assert!(!param.is_varying_next_eval());
}

#[test]
fn zero_length_ramp_jumps() {
    let (_ctx, param) = bound_param();
    param.ramp_to(0.5, 0.0).unwrap();

    let mut out = [0.0; 4];
    param.eval(0, 4, &mut out, 8);
    assert_eq!(out, [0.5; 4]);
    assert!(param.event().is_none());
}

#[test]
fn new_ramp_replaces_the_pending_one() {
    let (_ctx, param) = bound_param();
    param.ramp_to(0.0, 1.0).unwrap();
    param.ramp_to(2.0, 0.5).unwrap();

    let event = param.event().unwrap();
    assert_eq!(event.end_value, 2.0);
    assert_eq!(event.end_frame, 4);

    let mut out = [0.0; 4];
    param.eval(0, 4, &mut out, 8);
    assert_eq!(out, [1.0, 1.25, 1.5, 1.75]);
    assert_eq!(param.value(), 2.0);
}

#[test]
fn ramp_spans_several_blocks() {
    let (ctx, param) = bound_param();
    param.ramp_to(0.0, 1.0).unwrap();

    let mut out = [0.0; 4];
    param.eval(0, 4, &mut out, 8);
    assert_eq!(out, [1.0, 0.875, 0.75, 0.625]);
    assert!(param.event().is_some());
    assert!(param.is_varying_in(ctx.processed_frames() + 8));

    param.eval(4, 8, &mut out, 8);
    assert_eq!(out, [0.5, 0.375, 0.25, 0.125]);
    assert!(param.event().is_none());
}

#[test]
fn set_value_cancels_a_ramp() {
    let (_ctx, param) = bound_param();
    param.ramp_to(0.0, 1.0).unwrap();
    param.set_value(0.25);
    assert!(param.event().is_none());

    let mut out = [0.0; 4];
    param.eval(0, 4, &mut out, 8);
    assert_eq!(out, [0.25; 4]);
}
