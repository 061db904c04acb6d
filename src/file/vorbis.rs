//! Ogg Vorbis decoding through lewton.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use dasp_sample::Sample;
use lewton::inside_ogg::OggStreamReader;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::file::Decoder;

/// Decoder for Ogg Vorbis streams.
///
/// The stream is scanned once when opened to learn its length. Seeking
/// backwards rewinds to the first page and decodes forward, so seeks are
/// exact but proportional to the target position.
pub struct VorbisDecoder<R: Read + Seek = BufReader<File>> {
    reader: OggStreamReader<R>,
    channels: usize,
    sample_rate: u32,
    num_frames: u64,

    /// Interleaved samples of the last decoded packet.
    pending: Vec<i16>,
    pending_pos: usize,
    position: u64,
}

impl VorbisDecoder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> VorbisDecoder<R> {
    pub fn new(reader: R) -> Result<Self> {
        let mut reader = OggStreamReader::new(reader)?;
        let channels = (reader.ident_hdr.audio_channels as usize).max(1);
        let sample_rate = reader.ident_hdr.audio_sample_rate;

        let mut num_frames = 0u64;
        while let Some(packet) = reader.read_dec_packet_itl()? {
            num_frames += (packet.len() / channels) as u64;
        }
        reader.seek_absgp_pg(0)?;

        Ok(Self {
            reader,
            channels,
            sample_rate,
            num_frames,
            pending: Vec::new(),
            pending_pos: 0,
            position: 0,
        })
    }

    /// Make sure decoded samples are pending. Returns false at end of stream.
    fn fill_pending(&mut self) -> Result<bool> {
        while self.pending_pos + self.channels > self.pending.len() {
            match self.reader.read_dec_packet_itl()? {
                Some(packet) => {
                    self.pending = packet;
                    self.pending_pos = 0;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn skip_frames(&mut self, mut frames: u64) -> Result<()> {
        while frames > 0 && self.fill_pending()? {
            let available = ((self.pending.len() - self.pending_pos) / self.channels) as u64;
            let n = available.min(frames);
            self.pending_pos += n as usize * self.channels;
            self.position += n;
            frames -= n;
        }
        Ok(())
    }
}

impl<R: Read + Seek + Send> Decoder for VorbisDecoder<R> {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn num_frames(&self) -> u64 {
        self.num_frames
    }

    fn decode(&mut self, out: &mut Buffer) -> Result<usize> {
        let frames = out.num_frames();
        let channels = self.channels.min(out.num_channels());
        let mut written = 0;

        while written < frames && self.fill_pending()? {
            let available = (self.pending.len() - self.pending_pos) / self.channels;
            let n = available.min(frames - written);

            for ch in 0..channels {
                let dest = &mut out.channel_mut(ch)[written..written + n];
                let samples = self.pending[self.pending_pos + ch..]
                    .iter()
                    .step_by(self.channels);
                for (d, s) in dest.iter_mut().zip(samples) {
                    *d = s.to_sample::<f32>();
                }
            }

            self.pending_pos += n * self.channels;
            written += n;
        }

        self.position += written as u64;
        Ok(written)
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let frame = frame.min(self.num_frames);
        if frame < self.position {
            self.reader.seek_absgp_pg(0)?;
            self.pending.clear();
            self.pending_pos = 0;
            self.position = 0;
        }
        self.skip_frames(frame - self.position)
    }
}
