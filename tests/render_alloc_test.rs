//! The render pass must not touch the heap once the graph is configured.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use klanggraph::nodes::{Monitor, NullOutput, Sine};
use klanggraph::{Context, ContextConfig, Format};

struct CountingAllocator;

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn note_allocation() {
    let counting = COUNTING.try_with(Cell::get).unwrap_or(false);
    if counting {
        let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        note_allocation();
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

/// Allocations made by this thread while `f` runs.
fn allocations_during(f: impl FnOnce()) -> usize {
    ALLOCATIONS.with(|n| n.set(0));
    COUNTING.with(|c| c.set(true));
    f();
    COUNTING.with(|c| c.set(false));
    ALLOCATIONS.with(Cell::get)
}

fn context() -> std::sync::Arc<Context> {
    Context::new(
        ContextConfig::default()
            .with_sample_rate(48_000)
            .with_frames_per_block(64),
    )
}

#[test]
fn first_render_with_widened_monitor_does_not_allocate() {
    let ctx = context();
    let out = ctx.make_node(NullOutput::new());
    ctx.set_target(&out).unwrap();

    // Registered for auto-pull while still mono, then widened by its input.
    let (monitor, _reader) = Monitor::new(64);
    let monitor = ctx.make_node(monitor);
    let sine = ctx.make_node_with_format(Sine::new(440.0), Format::new().channels(2));
    sine.connect(&monitor).unwrap();
    assert_eq!(monitor.num_channels(), 2);

    sine.start().unwrap();
    ctx.initialize().unwrap();
    ctx.start().unwrap();

    let allocations = allocations_during(|| {
        ctx.render_block(|_| ()).unwrap();
    });
    assert_eq!(allocations, 0);
}

#[test]
fn fan_out_render_does_not_allocate() {
    let ctx = context();
    let out = ctx.make_node(NullOutput::new());
    ctx.set_target(&out).unwrap();

    let (monitor, _reader) = Monitor::new(64);
    let monitor = ctx.make_node(monitor);
    let sine = ctx.make_node(Sine::new(440.0));
    sine.connect(&out).unwrap();
    sine.connect(&monitor).unwrap();

    sine.start().unwrap();
    ctx.initialize().unwrap();
    ctx.start().unwrap();

    let allocations = allocations_during(|| {
        for _ in 0..4 {
            ctx.render_block(|_| ()).unwrap();
        }
    });
    assert_eq!(allocations, 0);
}
