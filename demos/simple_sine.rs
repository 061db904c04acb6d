//! Simple example: play a gliding sine wave on a chosen output device
//!
//! Run with: cargo run --example simple_sine --features cpal_io
//!
//! Lists available devices and lets you pick one, then plays a 440Hz sine
//! whose gain fades in and whose pitch is swept with messages.

use std::io::{self, Write};
use std::thread::sleep;
use std::time::{Duration, Instant};

use klanggraph::nodes::{Gain, Sine, SineMessage};
use klanggraph::{Context, ContextConfig, CpalDevice};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let devices = CpalDevice::list_outputs();
    if devices.is_empty() {
        eprintln!("No audio output devices found!");
        return Ok(());
    }

    println!("Available audio output devices:");
    for (i, device) in devices.iter().enumerate() {
        println!(
            "  [{}] {} ({}Hz, {} ch)",
            i,
            device.name(),
            device.sample_rate(),
            device.channels()
        );
    }

    print!("\nSelect device [0]: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let choice: usize = input.trim().parse().unwrap_or(0);

    let device = match devices.into_iter().nth(choice) {
        Some(device) => device,
        None => {
            println!("Invalid choice, using default device");
            CpalDevice::default_output().ok_or("No default device")?
        }
    };
    println!("\nUsing: {} @ {}Hz", device.name(), device.sample_rate());

    let ctx = Context::new(
        ContextConfig::default()
            .with_sample_rate(device.sample_rate())
            .with_frames_per_block(device.frames_per_block()),
    );
    let out = ctx.make_node(device.create_line_out());
    ctx.set_target(&out)?;

    let mut sine = ctx.make_node(Sine::new(440.0).with_amplitude(0.5));
    let gain = ctx.make_node(Gain::new(0.0));
    sine.connect(&gain)?.connect(&out)?;
    sine.start()?;

    ctx.initialize()?;
    ctx.start()?;

    if let Some(level) = gain.param("gain") {
        level.ramp_to(0.5, 2.0)?;
    }

    println!("Playing 440Hz sine wave...");
    println!("Press Ctrl+C to stop\n");
    print!("{}", ctx.print_graph());

    let started = Instant::now();
    loop {
        let elapsed = started.elapsed().as_secs_f32();
        let freq = 440.0 + 220.0 * (elapsed * 0.5 * std::f32::consts::PI).sin();
        let _ = sine.send(SineMessage::SetFrequency(freq));
        sleep(Duration::from_millis(10));
    }
}
