//! Sample players.
//!
//! [`BufferPlayer`] plays a buffer already in memory. [`FilePlayer`] streams
//! a [`SourceFile`] through per-channel ring buffers filled by a background
//! thread, so the audio thread never touches the decoder.
//!
//! Both stop themselves at the end of their material unless looping, and
//! report progress through a shared [`PlayerStatus`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::error::Result;
use crate::file::SourceFile;
use crate::node::{AudioNode, Format, InitContext, ProcessContext};
use crate::ring_buffer::{RingBuffer, RingReader, RingWriter};

/// Messages to control a player.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlayerMessage {
    /// Jump to a frame.
    Seek(u64),
    /// Enable or disable looping.
    SetLoop(bool),
}

const NO_UNDERRUN: u64 = u64::MAX;

/// Playback state shared between a player and the control thread.
#[derive(Debug)]
pub struct PlayerStatus {
    position: AtomicU64,
    playing: AtomicBool,
    underruns: AtomicU64,
    last_underrun: AtomicU64,
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self {
            position: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            last_underrun: AtomicU64::new(NO_UNDERRUN),
        }
    }
}

impl PlayerStatus {
    /// Read position in frames.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Blocks in which the stream could not deliver a full block.
    #[inline]
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Acquire)
    }

    /// Context frame of the most recent underrun, cleared by reading it.
    pub fn last_underrun(&self) -> Option<u64> {
        match self.last_underrun.swap(NO_UNDERRUN, Ordering::AcqRel) {
            NO_UNDERRUN => None,
            frame => Some(frame),
        }
    }

    pub(crate) fn record_underrun(&self, frame: u64) {
        self.underruns.fetch_add(1, Ordering::AcqRel);
        self.last_underrun.store(frame, Ordering::Release);
    }

    fn set_position(&self, frame: u64) {
        self.position.store(frame, Ordering::Release);
    }

    /// Move forward, wrapping at `length` when it is known.
    fn advance(&self, frames: usize, length: u64) {
        let mut position = self.position() + frames as u64;
        if length > 0 && position >= length {
            position %= length;
        }
        self.set_position(position);
    }

    fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }
}

/// Plays a buffer held in memory.
///
/// Starting the node rewinds to the first frame.
///
/// ```
/// use std::sync::Arc;
/// use klanggraph::{Buffer, Context, ContextConfig};
/// use klanggraph::nodes::{BufferPlayer, NullOutput};
///
/// let ctx = Context::new(ContextConfig::default().with_frames_per_block(4));
/// let out = ctx.make_node(NullOutput::new());
/// ctx.set_target(&out).unwrap();
///
/// let data = Arc::new(Buffer::from_channels(&[vec![0.5; 6], vec![-0.5; 6]]));
/// let player = BufferPlayer::new(data);
/// let status = player.status();
/// let player = ctx.make_node(player);
/// player.connect(&out).unwrap();
/// player.start().unwrap();
///
/// ctx.initialize().unwrap();
/// ctx.start().unwrap();
/// ctx.render_block(|_| ());
/// ctx.render_block(|_| ());
/// assert_eq!(status.position(), 6);
/// assert!(!player.is_enabled());
/// ```
pub struct BufferPlayer {
    source: Arc<Buffer>,
    read_position: usize,
    looping: bool,
    status: Arc<PlayerStatus>,
}

impl BufferPlayer {
    pub fn new(source: impl Into<Arc<Buffer>>) -> Self {
        Self {
            source: source.into(),
            read_position: 0,
            looping: false,
            status: Arc::new(PlayerStatus::default()),
        }
    }

    pub fn with_loop(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Shared playback status; clone it before handing the player to a
    /// context.
    pub fn status(&self) -> Arc<PlayerStatus> {
        self.status.clone()
    }

    #[inline]
    pub fn num_frames(&self) -> usize {
        self.source.num_frames()
    }
}

impl AudioNode for BufferPlayer {
    type Message = PlayerMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = PlayerMessage>,
        buffer: &mut Buffer,
    ) {
        let total = self.source.num_frames();
        for msg in messages {
            match msg {
                PlayerMessage::Seek(frame) => {
                    self.read_position = (frame as usize).min(total);
                    self.status.set_position(self.read_position as u64);
                }
                PlayerMessage::SetLoop(looping) => self.looping = looping,
            }
        }

        let frames = buffer.num_frames();
        let source_channels = self.source.num_channels().max(1);
        let mut written = 0;

        while written < frames {
            if self.read_position >= total {
                if self.looping && total > 0 {
                    self.read_position = 0;
                    continue;
                }
                for channel in buffer.channels_mut() {
                    channel[written..].fill(0.0);
                }
                ctx.disable_node();
                self.status.set_playing(false);
                break;
            }

            let n = (total - self.read_position).min(frames - written);
            let start = self.read_position;
            for (ch, dest) in buffer.channels_mut().enumerate() {
                let source = self.source.channel(ch % source_channels);
                dest[written..written + n].copy_from_slice(&source[start..start + n]);
            }
            self.read_position += n;
            written += n;
        }

        self.status.set_position(self.read_position as u64);
    }

    fn start(&mut self) -> Result<()> {
        self.read_position = 0;
        self.status.set_position(0);
        self.status.set_playing(true);
        Ok(())
    }

    fn stop(&mut self) {
        self.status.set_playing(false);
    }

    fn name(&self) -> &'static str {
        "BufferPlayer"
    }

    fn default_format(&self) -> Format {
        Format::new().channels(self.source.num_channels().max(1))
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }
}

/// Read-ahead state shared between a [`FilePlayer`] and its reader thread.
///
/// Seeking is a three step handshake so no stale frames reach the output:
/// the audio thread bumps `seek_generation`, the reader seeks and publishes
/// `seek_ack`, the audio thread drains the rings and publishes
/// `seek_drained`, and only then does the reader resume writing.
#[derive(Debug, Default)]
struct ReadAhead {
    alive: AtomicBool,
    looping: AtomicBool,
    finished: AtomicBool,
    seek_frame: AtomicU64,
    seek_generation: AtomicU64,
    seek_ack: AtomicU64,
    seek_drained: AtomicU64,
}

enum Feed {
    /// Waiting for the first initialize to learn the output format.
    Pending(SourceFile),
    /// Streaming from the reader thread.
    Threaded(Vec<RingReader>),
    /// Decoding inside `process`, for offline rendering and tests.
    Inline(SourceFile),
    Empty,
}

/// Streams an audio file.
///
/// By default a background thread decodes ahead into one ring buffer per
/// channel; when it falls behind the player outputs silence for the missing
/// frames and counts an underrun. [`FilePlayer::inline`] decodes on the
/// render thread instead, which is deterministic but only suitable when the
/// render is not real-time.
pub struct FilePlayer {
    feed: Feed,
    channels: usize,
    /// Length in output frames, known after initialize.
    length: u64,
    shared: Arc<ReadAhead>,
    status: Arc<PlayerStatus>,
    threaded: bool,
}

impl FilePlayer {
    pub fn new(file: SourceFile) -> Self {
        let channels = file.channels().max(1);
        Self {
            feed: Feed::Pending(file),
            channels,
            length: 0,
            shared: Arc::new(ReadAhead::default()),
            status: Arc::new(PlayerStatus::default()),
            threaded: true,
        }
    }

    /// Decode on the render thread rather than a background reader.
    pub fn inline(mut self) -> Self {
        self.threaded = false;
        self
    }

    pub fn with_loop(self, looping: bool) -> Self {
        self.shared.looping.store(looping, Ordering::Release);
        self
    }

    pub fn status(&self) -> Arc<PlayerStatus> {
        self.status.clone()
    }

    fn request_seek(&self, frame: u64) {
        self.shared.seek_frame.store(frame, Ordering::Release);
        self.shared.seek_generation.fetch_add(1, Ordering::AcqRel);
        self.status.set_position(frame);
    }

    fn spawn_reader(&mut self, mut file: SourceFile, frames_per_block: usize) -> Result<()> {
        let frames_per_read = frames_per_block.max(512);
        file.set_frames_per_read(frames_per_read);

        let capacity = frames_per_read * 2;
        let (writers, readers): (Vec<RingWriter>, Vec<RingReader>) =
            (0..self.channels).map(|_| RingBuffer::new(capacity)).unzip();

        self.shared.alive.store(true, Ordering::Release);
        let shared = self.shared.clone();
        thread::Builder::new()
            .name("klanggraph-file-reader".into())
            .spawn(move || read_ahead(file, writers, shared, frames_per_read))?;

        self.feed = Feed::Threaded(readers);
        Ok(())
    }

    fn handle(&mut self, messages: impl Iterator<Item = PlayerMessage>) {
        for msg in messages {
            match msg {
                PlayerMessage::SetLoop(looping) => {
                    self.shared.looping.store(looping, Ordering::Release)
                }
                PlayerMessage::Seek(frame) => match &mut self.feed {
                    Feed::Inline(file) => {
                        if file.seek(frame).is_ok() {
                            self.status.set_position(file.position());
                        }
                    }
                    _ => self.request_seek(frame),
                },
            }
        }
    }

    fn process_threaded(&mut self, ctx: &ProcessContext, buffer: &mut Buffer) {
        let Feed::Threaded(readers) = &mut self.feed else {
            buffer.zero();
            return;
        };
        let shared = &self.shared;

        let generation = shared.seek_generation.load(Ordering::Acquire);
        if shared.seek_ack.load(Ordering::Acquire) != generation {
            buffer.zero();
            return;
        }
        if shared.seek_drained.load(Ordering::Acquire) != generation {
            for reader in readers.iter_mut() {
                reader.clear();
            }
            shared.seek_drained.store(generation, Ordering::Release);
            buffer.zero();
            return;
        }

        let frames = buffer.num_frames();
        let sources = readers.len().min(buffer.num_channels());
        let mut got = frames;
        for (ch, reader) in readers.iter_mut().enumerate().take(sources) {
            let dest = buffer.channel_mut(ch);
            let n = reader.read(dest);
            dest[n..].fill(0.0);
            got = got.min(n);
        }
        if sources > 0 {
            let data = buffer.data_mut();
            for ch in sources..data.len() / frames.max(1) {
                let from = (ch % sources) * frames;
                data.copy_within(from..from + frames, ch * frames);
            }
        }
        let wrap_at = if shared.looping.load(Ordering::Acquire) {
            self.length
        } else {
            0
        };
        self.status.advance(got, wrap_at);

        if got < frames {
            let drained = readers.iter().all(|r| r.available_read() == 0);
            if shared.finished.load(Ordering::Acquire) && drained {
                ctx.disable_node();
                self.status.set_playing(false);
            } else {
                self.status.record_underrun(ctx.processed_frames + got as u64);
            }
        }
    }

    fn process_inline(&mut self, ctx: &ProcessContext, buffer: &mut Buffer) {
        let Feed::Inline(file) = &mut self.feed else {
            buffer.zero();
            return;
        };

        let frames = buffer.num_frames();
        let mut written = 0;
        while written < frames {
            let n = file
                .read_frames(buffer, written, frames - written)
                .unwrap_or(0);
            if n > 0 {
                written += n;
                continue;
            }
            let looping = self.shared.looping.load(Ordering::Acquire);
            if looping && file.num_frames() > 0 && file.seek(0).is_ok() {
                continue;
            }
            for channel in buffer.channels_mut() {
                channel[written..].fill(0.0);
            }
            ctx.disable_node();
            self.status.set_playing(false);
            break;
        }
        self.status.set_position(file.position());
    }
}

impl AudioNode for FilePlayer {
    type Message = PlayerMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = PlayerMessage>,
        buffer: &mut Buffer,
    ) {
        self.handle(messages);
        if self.threaded {
            self.process_threaded(ctx, buffer);
        } else {
            self.process_inline(ctx, buffer);
        }
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        let mut file = match core::mem::replace(&mut self.feed, Feed::Empty) {
            Feed::Pending(file) => file,
            feed => {
                self.feed = feed;
                return Ok(());
            }
        };

        file.set_output_format(ctx.sample_rate, self.channels);
        self.length = file.num_frames();
        debug!(
            node = ?ctx.node_id,
            native_rate = file.native_sample_rate(),
            rate = ctx.sample_rate,
            channels = self.channels,
            threaded = self.threaded,
            "file player ready"
        );
        if self.threaded {
            self.spawn_reader(file, ctx.frames_per_block)
        } else {
            self.feed = Feed::Inline(file);
            Ok(())
        }
    }

    /// Restarts from the beginning if the previous run reached the end.
    fn start(&mut self) -> Result<()> {
        if !self.status.is_playing() {
            if let Feed::Inline(file) = &mut self.feed {
                file.seek(0)?;
                self.status.set_position(0);
            } else if self.shared.finished.load(Ordering::Acquire) {
                self.request_seek(0);
            }
        }
        self.status.set_playing(true);
        Ok(())
    }

    fn stop(&mut self) {
        self.status.set_playing(false);
    }

    fn name(&self) -> &'static str {
        "FilePlayer"
    }

    fn default_format(&self) -> Format {
        Format::new().channels(self.channels)
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }
}

impl Drop for FilePlayer {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
    }
}

fn read_ahead(
    mut file: SourceFile,
    mut writers: Vec<RingWriter>,
    shared: Arc<ReadAhead>,
    frames_per_read: usize,
) {
    const IDLE: Duration = Duration::from_millis(2);

    let mut block = Buffer::new(frames_per_read, writers.len());
    let mut pending = 0..0;
    let mut generation = 0;

    while shared.alive.load(Ordering::Acquire) {
        let requested = shared.seek_generation.load(Ordering::Acquire);
        if requested != generation {
            generation = requested;
            if let Err(err) = file.seek(shared.seek_frame.load(Ordering::Acquire)) {
                warn!(error = %err, "file seek failed");
            }
            pending = 0..0;
            shared.finished.store(false, Ordering::Release);
            shared.seek_ack.store(generation, Ordering::Release);
        }
        if shared.seek_drained.load(Ordering::Acquire) != generation {
            thread::sleep(IDLE);
            continue;
        }

        if pending.is_empty() {
            let read = match file.read(&mut block) {
                Ok(read) => read,
                Err(err) => {
                    warn!(error = %err, "file read failed");
                    0
                }
            };
            if read == 0 {
                let looping = shared.looping.load(Ordering::Acquire);
                if looping && file.num_frames() > 0 && file.seek(0).is_ok() {
                    continue;
                }
                shared.finished.store(true, Ordering::Release);
                thread::sleep(IDLE);
                continue;
            }
            pending = 0..read;
        }

        let room = writers
            .iter()
            .map(RingWriter::available_write)
            .min()
            .unwrap_or(0);
        let n = room.min(pending.len());
        if n == 0 {
            if writers.iter().any(RingWriter::is_abandoned) {
                break;
            }
            thread::sleep(IDLE);
            continue;
        }
        for (ch, writer) in writers.iter_mut().enumerate() {
            writer.write(&block.channel(ch)[pending.start..pending.start + n]);
        }
        pending.start += n;
    }
    debug!("file reader exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextConfig};
    use crate::nodes::NullOutput;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn ramp(frames: usize) -> Buffer {
        Buffer::from_channels(&[(0..frames).map(|i| i as f32).collect()])
    }

    #[test]
    fn buffer_player_loops_and_seeks() {
        let enabled = AtomicBool::new(true);
        let ctx = ProcessContext::new(48_000, 4, 0, &enabled);
        let mut player = BufferPlayer::new(ramp(3)).with_loop(true);
        player.start().unwrap();

        let mut buffer = Buffer::new(4, 2);
        player.process(&ctx, core::iter::empty(), &mut buffer);
        assert_eq!(buffer.channel(0), &[0.0, 1.0, 2.0, 0.0]);
        assert_eq!(buffer.channel(1), buffer.channel(0));

        player.process(&ctx, [PlayerMessage::Seek(2)].into_iter(), &mut buffer);
        assert_eq!(buffer.channel(0), &[2.0, 0.0, 1.0, 2.0]);
        assert!(enabled.load(Ordering::Acquire));
    }

    #[test]
    fn buffer_player_disables_itself_at_end() {
        let enabled = AtomicBool::new(true);
        let ctx = ProcessContext::new(48_000, 4, 0, &enabled);
        let mut player = BufferPlayer::new(ramp(2));
        let status = player.status();
        player.start().unwrap();

        let mut buffer = Buffer::new(4, 1);
        player.process(&ctx, core::iter::empty(), &mut buffer);
        assert_eq!(buffer.channel(0), &[0.0, 1.0, 0.0, 0.0]);
        assert!(!enabled.load(Ordering::Acquire));
        assert!(!status.is_playing());
        assert_eq!(status.position(), 2);
    }

    fn player_graph(player: FilePlayer) -> (Arc<Context>, Arc<PlayerStatus>) {
        let ctx = Context::new(
            ContextConfig::default()
                .with_sample_rate(48_000)
                .with_frames_per_block(8),
        );
        let out = ctx.make_node(NullOutput::new());
        ctx.set_target(&out).unwrap();
        let status = player.status();
        let player = ctx.make_node(player);
        player.connect(&out).unwrap();
        player.start().unwrap();
        ctx.initialize().unwrap();
        ctx.start().unwrap();
        (ctx, status)
    }

    #[test]
    fn inline_file_player_streams_to_end() {
        let file = SourceFile::from_buffer(ramp(12), 48_000);
        let (ctx, status) = player_graph(FilePlayer::new(file).inline());

        let first = ctx.render_block(|out| out.channel(0).to_vec()).unwrap();
        assert_eq!(first, (0..8).map(|i| i as f32).collect::<Vec<_>>());
        let second = ctx.render_block(|out| out.channel(1).to_vec()).unwrap();
        assert_eq!(&second[..4], &[8.0, 9.0, 10.0, 11.0]);
        assert!(second[4..].iter().all(|s| *s == 0.0));
        assert!(!status.is_playing());
        assert_eq!(status.underruns(), 0);
    }

    #[test]
    fn inline_file_player_loops() {
        let file = SourceFile::from_buffer(ramp(3), 48_000);
        let (ctx, status) = player_graph(FilePlayer::new(file).inline().with_loop(true));

        let block = ctx.render_block(|out| out.channel(0).to_vec()).unwrap();
        assert_eq!(block, vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0, 1.0]);
        assert!(status.is_playing());
        assert_eq!(status.position(), 2);
    }

    #[test]
    fn threaded_file_player_delivers_frames_in_order() {
        let file = SourceFile::from_buffer(ramp(64), 48_000);
        let (ctx, status) = player_graph(FilePlayer::new(file));

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.len() < 64 && Instant::now() < deadline {
            let before = status.position() as usize;
            let block = ctx.render_block(|out| out.channel(0).to_vec()).unwrap();
            let after = status.position() as usize;
            received.extend_from_slice(&block[..after - before]);
            thread::sleep(Duration::from_millis(1));
        }
        let expected: Vec<f32> = (0..64).map(|i| i as f32).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn last_underrun_resets_on_read() {
        let status = PlayerStatus::default();
        assert_eq!(status.last_underrun(), None);
        status.record_underrun(128);
        assert_eq!(status.underruns(), 1);
        assert_eq!(status.last_underrun(), Some(128));
        assert_eq!(status.last_underrun(), None);
    }
}
