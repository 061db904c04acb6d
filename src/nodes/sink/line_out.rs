//! CPAL audio output target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread::{self, Thread};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig};
use tracing::{debug, error};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::node::{AudioNode, ChannelMode, Format, InitContext, ProcessContext};

/// Render target playing through a CPAL output stream.
///
/// The stream lives on its own thread, started with the context. Each device
/// callback drains the block staged by the previous render and runs
/// [`Context::render_block`] whenever it needs more, so the graph renders on
/// the device's clock. When the context is not running the device gets
/// silence.
pub struct LineOut {
    device: cpal::Device,
    config: SupportedStreamConfig,
    frames_per_block: usize,
    context: Weak<Context>,
    alive: Arc<AtomicBool>,
    stream_thread: Option<Thread>,
}

impl LineOut {
    pub(crate) fn new(
        device: cpal::Device,
        config: SupportedStreamConfig,
        frames_per_block: usize,
    ) -> Self {
        Self {
            device,
            config,
            frames_per_block,
            context: Weak::new(),
            alive: Arc::new(AtomicBool::new(false)),
            stream_thread: None,
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.config.channels() as usize
    }

    fn signal_stop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(thread) = self.stream_thread.take() {
            thread.unpark();
        }
    }
}

impl AudioNode for LineOut {
    type Message = ();

    fn process(&mut self, _ctx: &ProcessContext, _messages: impl Iterator<Item = ()>, _buffer: &mut Buffer) {}

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.context = ctx.weak_context();
        if ctx.sample_rate != self.config.sample_rate().0 {
            debug!(
                context_rate = ctx.sample_rate,
                device_rate = self.config.sample_rate().0,
                "context rate differs from the device"
            );
        }
        Ok(())
    }

    /// Build and play the stream. Blocks until the stream is running or has
    /// failed to start.
    fn start(&mut self) -> Result<()> {
        if self.alive.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.context.strong_count() == 0 {
            self.alive.store(false, Ordering::Release);
            return Err(Error::NotInitialized);
        }

        let device = self.device.clone();
        let config = self.config.clone();
        let context = self.context.clone();
        let alive = self.alive.clone();
        let frames_per_block = self.frames_per_block;
        let (started_tx, started_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("klanggraph-line-out".into())
            .spawn(move || {
                let stream = match build_stream(&device, &config, context, frames_per_block)
                    .and_then(|stream| {
                        stream
                            .play()
                            .map_err(|err| Error::Device(err.to_string()))?;
                        Ok(stream)
                    }) {
                    Ok(stream) => {
                        let _ = started_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = started_tx.send(Err(err));
                        return;
                    }
                };

                // The stream lives as long as this thread.
                while alive.load(Ordering::Acquire) {
                    thread::park();
                }
                drop(stream);
                debug!("line out stream closed");
            })?;

        let started = started_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Device("stream thread exited".into())));
        match started {
            Ok(()) => {
                self.stream_thread = Some(handle.thread().clone());
                debug!(channels = self.channels(), "line out started");
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
        "LineOut"
    }

    fn default_format(&self) -> Format {
        Format::new()
            .channels(self.channels())
            .channel_mode(ChannelMode::Specified)
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        0
    }

    fn native_sample_rate(&self) -> Option<u32> {
        Some(self.config.sample_rate().0)
    }

    fn native_frames_per_block(&self) -> Option<usize> {
        Some(self.frames_per_block)
    }
}

impl Drop for LineOut {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    context: Weak<Context>,
    frames_per_block: usize,
) -> Result<cpal::Stream> {
    match config.sample_format() {
        SampleFormat::F32 => build_typed::<f32>(device, config, context, frames_per_block),
        SampleFormat::I16 => build_typed::<i16>(device, config, context, frames_per_block),
        SampleFormat::U16 => build_typed::<u16>(device, config, context, frames_per_block),
        other => Err(Error::Device(format!("unsupported sample format {other:?}"))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    context: Weak<Context>,
    frames_per_block: usize,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels() as usize;
    let mut staged = vec![0.0f32; frames_per_block * channels];
    let mut cursor = staged.len();

    device
        .build_output_stream(
            &config.config(),
            move |data: &mut [T], _| {
                let mut written = 0;
                while written < data.len() {
                    if cursor == staged.len() {
                        let rendered = context.upgrade().and_then(|ctx| {
                            ctx.render_block(|block| {
                                // The context may have been reconfigured since
                                // the stream was built.
                                let len = block.num_frames() * block.num_channels();
                                staged.resize(len, 0.0);
                                block.interleave_into(&mut staged);
                            })
                        });
                        if rendered.is_none() || staged.is_empty() {
                            data[written..].fill(T::EQUILIBRIUM);
                            return;
                        }
                        cursor = 0;
                    }
                    let n = (staged.len() - cursor).min(data.len() - written);
                    for (out, sample) in data[written..written + n]
                        .iter_mut()
                        .zip(&staged[cursor..cursor + n])
                    {
                        *out = T::from_sample(*sample);
                    }
                    cursor += n;
                    written += n;
                }
            },
            |err| error!(error = %err, "output stream error"),
            None,
        )
        .map_err(|err| Error::Device(err.to_string()))
}
