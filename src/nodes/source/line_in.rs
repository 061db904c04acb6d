//! CPAL audio input source.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, Thread};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig};
use tracing::{debug, error, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::node::{AudioNode, ChannelMode, Format, InitContext, ProcessContext};
use crate::ring_buffer::{RingBuffer, RingReader, RingWriter};

/// Input blocks buffered between the device and the graph.
const BUFFERED_BLOCKS: usize = 8;

/// Dropouts seen by a [`LineIn`].
#[derive(Debug, Default)]
pub struct LineInStatus {
    overruns: AtomicU64,
    underruns: AtomicU64,
}

impl LineInStatus {
    /// Device callbacks that found the buffer full and dropped frames.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Acquire)
    }

    /// Blocks the graph rendered with missing input frames.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Acquire)
    }
}

/// Source capturing a CPAL input stream.
///
/// The device callback deinterleaves into one ring buffer per channel and the
/// node reads one block per render. No rate conversion is done: the context
/// should run at the device rate.
pub struct LineIn {
    device: cpal::Device,
    config: SupportedStreamConfig,
    readers: Vec<RingReader>,
    capacity: usize,
    status: Arc<LineInStatus>,
    alive: Arc<AtomicBool>,
    stream_thread: Option<Thread>,
}

impl LineIn {
    pub(crate) fn new(device: cpal::Device, config: SupportedStreamConfig) -> Self {
        Self {
            device,
            config,
            readers: Vec::new(),
            capacity: 0,
            status: Arc::new(LineInStatus::default()),
            alive: Arc::new(AtomicBool::new(false)),
            stream_thread: None,
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.config.channels() as usize
    }

    pub fn status(&self) -> Arc<LineInStatus> {
        self.status.clone()
    }

    fn signal_stop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(thread) = self.stream_thread.take() {
            thread.unpark();
        }
    }
}

impl AudioNode for LineIn {
    type Message = ();

    fn process(&mut self, _ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, buffer: &mut Buffer) {
        let frames = buffer.num_frames();
        let mut short = false;
        for (dest, reader) in buffer.channels_mut().zip(self.readers.iter_mut()) {
            let n = reader.read(dest);
            if n < frames {
                dest[n..].fill(0.0);
                short = true;
            }
        }
        if short {
            self.status.underruns.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        if ctx.sample_rate != self.config.sample_rate().0 {
            warn!(
                context_rate = ctx.sample_rate,
                device_rate = self.config.sample_rate().0,
                "line in runs at a different rate than the context"
            );
        }
        self.capacity = ctx.frames_per_block * BUFFERED_BLOCKS;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.alive.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Fresh buffers per stream.
        let capacity = self.capacity.max(4096);
        let (writers, readers): (Vec<RingWriter>, Vec<RingReader>) = (0..self.channels())
            .map(|_| RingBuffer::new(capacity))
            .unzip();
        self.readers = readers;

        let device = self.device.clone();
        let config = self.config.clone();
        let status = self.status.clone();
        let alive = self.alive.clone();
        let (started_tx, started_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("klanggraph-line-in".into())
            .spawn(move || {
                let stream = match build_stream(&device, &config, writers, status).and_then(
                    |stream| {
                        stream
                            .play()
                            .map_err(|err| Error::Device(err.to_string()))?;
                        Ok(stream)
                    },
                ) {
                    Ok(stream) => {
                        let _ = started_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = started_tx.send(Err(err));
                        return;
                    }
                };
                while alive.load(Ordering::Acquire) {
                    thread::park();
                }
                drop(stream);
                debug!("line in stream closed");
            })?;

        let started = started_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Device("stream thread exited".into())));
        match started {
            Ok(()) => {
                self.stream_thread = Some(handle.thread().clone());
                debug!(channels = self.channels(), "line in started");
                Ok(())
            }
            Err(err) => {
                self.alive.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn stop(&mut self) {
        self.signal_stop();
    }

    fn name(&self) -> &'static str {
        "LineIn"
    }

    fn default_format(&self) -> Format {
        Format::new()
            .channels(self.channels())
            .channel_mode(ChannelMode::Specified)
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }
}

impl Drop for LineIn {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    writers: Vec<RingWriter>,
    status: Arc<LineInStatus>,
) -> Result<cpal::Stream> {
    match config.sample_format() {
        SampleFormat::F32 => build_typed::<f32>(device, config, writers, status),
        SampleFormat::I16 => build_typed::<i16>(device, config, writers, status),
        SampleFormat::U16 => build_typed::<u16>(device, config, writers, status),
        other => Err(Error::Device(format!("unsupported sample format {other:?}"))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    mut writers: Vec<RingWriter>,
    status: Arc<LineInStatus>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = (config.channels() as usize).max(1);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            &config.config(),
            move |data: &[T], _| {
                let frames = data.len() / channels;
                scratch.resize(frames, 0.0);
                let mut dropped = false;
                for (ch, writer) in writers.iter_mut().enumerate() {
                    for (out, frame) in scratch.iter_mut().zip(data.chunks_exact(channels)) {
                        *out = f32::from_sample(frame[ch]);
                    }
                    dropped |= writer.write(&scratch) < frames;
                }
                if dropped {
                    status.overruns.fetch_add(1, Ordering::AcqRel);
                }
            },
            |err| error!(error = %err, "input stream error"),
            None,
        )
        .map_err(|err| Error::Device(err.to_string()))
}
