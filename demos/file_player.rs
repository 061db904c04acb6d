//! Stream an Ogg Vorbis file to the default output device
//!
//! Run with: cargo run --example file_player --features cpal_io -- song.ogg
//!
//! The file is decoded on a background thread, converted to the device
//! rate and played through a stereo mixer until it ends.

use std::thread::sleep;
use std::time::Duration;

use klanggraph::file::SourceFile;
use klanggraph::nodes::{FilePlayer, Mixer};
use klanggraph::Context;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .ok_or("usage: file_player <file.ogg>")?;

    let file = SourceFile::open(&path)?;
    println!(
        "{}: {} frames, {} ch @ {}Hz",
        path,
        file.native_num_frames(),
        file.native_channels(),
        file.native_sample_rate()
    );

    let ctx = Context::with_default_output()?;
    let out = ctx.target().ok_or("no output")?;

    let player = FilePlayer::new(file);
    let status = player.status();
    let player = ctx.make_node(player);
    let mixer = ctx.make_node(Mixer::stereo());
    player.connect(&mixer)?.connect(&out)?;

    ctx.initialize()?;
    ctx.start()?;
    player.start()?;

    println!("Playing at {}Hz...", ctx.sample_rate());
    while status.is_playing() {
        sleep(Duration::from_millis(250));
        print!("\r{:.1}s", status.position() as f64 / ctx.sample_rate() as f64);
        if let Some(frame) = status.last_underrun() {
            eprintln!("\nunderrun at frame {frame}");
        }
    }
    println!("\nDone, {} underruns", status.underruns());

    ctx.stop();
    Ok(())
}
