//! Band-limited wavetable oscillator.

use std::f64::consts::{PI, TAU};

use tracing::debug;

use super::gen::{OscMessage, Phasor};
use crate::buffer::Buffer;
use crate::dsp;
use crate::error::Result;
use crate::node::{AudioNode, Format, InitContext, ProcessContext};

const DEFAULT_TABLE_SIZE: usize = 4096;
const DEFAULT_NUM_TABLES: usize = 40;
/// Fundamentals at or below this share the richest table.
const LOWEST_FREQUENCY: f32 = 20.0;

/// Shapes a [`WaveTable`] can be filled with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl Waveform {
    /// Amplitudes of harmonics `1..=harmonics`.
    fn partials(self, harmonics: usize, out: &mut Vec<f64>) {
        out.clear();
        if self == Waveform::Sine {
            out.push(1.0);
            return;
        }
        out.resize(harmonics, 0.0);
        match self {
            Waveform::Sine => {}
            Waveform::Square => {
                for h in (1..=harmonics).step_by(2) {
                    out[h - 1] = gibbs_taper(h, harmonics) / h as f64;
                }
            }
            Waveform::Sawtooth => {
                for h in 1..=harmonics {
                    out[h - 1] = gibbs_taper(h, harmonics) / h as f64;
                }
            }
            Waveform::Triangle => {
                // Falls off as 1/h², fast enough to need no taper.
                let mut sign = 1.0;
                for h in (1..=harmonics).step_by(2) {
                    out[h - 1] = sign / (h * h) as f64;
                    sign = -sign;
                }
            }
        }
    }
}

/// cos² window over the partials, damping the ringing of a truncated series.
fn gibbs_taper(harmonic: usize, harmonics: usize) -> f64 {
    if harmonics <= 1 {
        return 1.0;
    }
    let c = (harmonic as f64 * PI * 0.5 / harmonics as f64).cos();
    c * c
}

/// Single-cycle tables of one waveform, each band-limited for a range of
/// fundamentals.
///
/// The MIDI range from 20 Hz to a quarter of the sample rate is split evenly
/// over the tables. Table `i` keeps only the harmonics that stay below
/// Nyquist for the highest fundamental it serves. The last table is a pure
/// sine and serves everything above the range.
///
/// ```
/// use klanggraph::nodes::{WaveTable, Waveform};
///
/// let saw = WaveTable::with_size(Waveform::Sawtooth, 48_000, 512, 8);
/// assert_eq!(saw.table_index(10.0), 0);
/// assert_eq!(saw.table_index(15_000.0), 7);
/// assert_eq!(saw.max_harmonic(7), 1);
/// ```
#[derive(Clone, Debug)]
pub struct WaveTable {
    waveform: Waveform,
    sample_rate: u32,
    min_midi: f32,
    max_midi: f32,
    tables: Buffer,
}

impl WaveTable {
    /// 40 tables of 4096 samples.
    pub fn new(waveform: Waveform, sample_rate: u32) -> Self {
        Self::with_size(waveform, sample_rate, DEFAULT_TABLE_SIZE, DEFAULT_NUM_TABLES)
    }

    /// `table_size` is at least 4 and `num_tables` at least 2.
    pub fn with_size(waveform: Waveform, sample_rate: u32, table_size: usize, num_tables: usize) -> Self {
        let sample_rate = sample_rate.max(1);
        let min_midi = dsp::to_midi(LOWEST_FREQUENCY);
        let max_midi = dsp::to_midi(sample_rate as f32 / 4.0).max(min_midi + 1.0);
        let mut table = Self {
            waveform,
            sample_rate,
            min_midi,
            max_midi,
            tables: Buffer::new(table_size.max(4), num_tables.max(2)),
        };
        table.fill();
        table
    }

    #[inline]
    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn table_size(&self) -> usize {
        self.tables.num_frames()
    }

    #[inline]
    pub fn num_tables(&self) -> usize {
        self.tables.num_channels()
    }

    fn midi_per_table(&self) -> f32 {
        (self.max_midi - self.min_midi) / (self.num_tables() - 1) as f32
    }

    /// Highest fundamental served by table `index`.
    pub fn top_frequency(&self, index: usize) -> f32 {
        dsp::to_freq(self.min_midi + index as f32 * self.midi_per_table())
    }

    /// Highest harmonic stored in table `index`.
    pub fn max_harmonic(&self, index: usize) -> usize {
        if index >= self.num_tables() - 1 {
            return 1;
        }
        let nyquist = self.sample_rate as f32 / 2.0;
        // Above half the table size the table itself would alias.
        ((nyquist / self.top_frequency(index)) as usize).clamp(1, self.table_size() / 2 - 1)
    }

    /// Index of the table to play a fundamental of `frequency` Hz from.
    pub fn table_index(&self, frequency: f32) -> usize {
        let last = self.num_tables() - 1;
        let midi = dsp::to_midi(frequency);
        if midi <= self.min_midi {
            return 0;
        }
        if midi >= self.max_midi {
            return last;
        }
        ((1.0 + (midi - self.min_midi) / self.midi_per_table()) as usize).min(last)
    }

    /// Samples of table `index`. Panics when `index` is out of range.
    #[inline]
    pub fn table(&self, index: usize) -> &[f32] {
        self.tables.channel(index)
    }

    /// Value at `phase` (in cycles) of the table for `frequency`.
    pub fn lookup(&self, frequency: f32, phase: f32) -> f32 {
        lookup(self.table(self.table_index(frequency)), phase)
    }

    fn fill(&mut self) {
        let size = self.table_size();
        let sine: Vec<f64> = (0..size).map(|i| (TAU * i as f64 / size as f64).sin()).collect();
        let mut partials = Vec::new();

        for index in 0..self.num_tables() {
            self.waveform.partials(self.max_harmonic(index), &mut partials);
            let table = self.tables.channel_mut(index);
            for (i, sample) in table.iter_mut().enumerate() {
                let value: f64 = partials
                    .iter()
                    .enumerate()
                    .map(|(p, amplitude)| amplitude * sine[(p + 1) * i % size])
                    .sum();
                *sample = value as f32;
            }
            dsp::normalize(table);
        }
    }
}

/// Linear interpolation into a single cycle, `phase` in `0..1`.
#[inline]
fn lookup(table: &[f32], phase: f32) -> f32 {
    let len = table.len();
    let position = phase * len as f32;
    let index = position as usize % len;
    let next = if index + 1 == len { 0 } else { index + 1 };
    let frac = position.fract();
    table[index] + frac * (table[next] - table[index])
}

/// An oscillator playing band-limited square, sawtooth or triangle waves
/// without audible aliasing.
///
/// Tables are built for the context's sample rate when the node is
/// initialized. The table is chosen once per block from the current
/// frequency. Takes the same [`OscMessage`]s as [`Sine`](super::Sine).
pub struct WaveTableOsc {
    osc: Phasor,
    waveform: Waveform,
    table_size: usize,
    num_tables: usize,
    table: Option<WaveTable>,
}

impl WaveTableOsc {
    pub fn new(waveform: Waveform, frequency: f32) -> Self {
        Self {
            osc: Phasor::new(frequency),
            waveform,
            table_size: DEFAULT_TABLE_SIZE,
            num_tables: DEFAULT_NUM_TABLES,
            table: None,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.osc.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    /// Trade table memory and build time against precision.
    pub fn with_table_size(mut self, table_size: usize, num_tables: usize) -> Self {
        self.table_size = table_size;
        self.num_tables = num_tables;
        self
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.osc.frequency
    }

    #[inline]
    pub fn waveform(&self) -> Waveform {
        self.waveform
    }
}

impl AudioNode for WaveTableOsc {
    type Message = OscMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = OscMessage>,
        buffer: &mut Buffer,
    ) {
        self.osc.handle(messages);
        let Some(table) = &self.table else {
            buffer.zero();
            return;
        };
        let cycle = table.table(table.table_index(self.osc.frequency));
        self.osc
            .render(ctx.sample_rate, buffer, |phase| lookup(cycle, phase));
    }

    fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        if self.table.as_ref().is_some_and(|t| t.sample_rate() == ctx.sample_rate) {
            return Ok(());
        }
        self.table = Some(WaveTable::with_size(
            self.waveform,
            ctx.sample_rate,
            self.table_size,
            self.num_tables,
        ));
        debug!(
            waveform = ?self.waveform,
            sample_rate = ctx.sample_rate,
            tables = self.num_tables,
            "wavetables built"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WaveTableOsc"
    }

    fn default_format(&self) -> Format {
        Format::new().channels(1)
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextConfig};
    use crate::nodes::NullOutput;
    use approx::assert_relative_eq;

    /// Magnitude of harmonic `k` in one cycle.
    fn harmonic_magnitude(table: &[f32], k: usize) -> f64 {
        let n = table.len() as f64;
        let (re, im) = table.iter().enumerate().fold((0.0, 0.0), |(re, im), (i, s)| {
            let w = TAU * (k * i) as f64 / n;
            (re + *s as f64 * w.cos(), im + *s as f64 * w.sin())
        });
        (re * re + im * im).sqrt() * 2.0 / n
    }

    #[test]
    fn table_index_follows_midi_ranges() {
        let table = WaveTable::with_size(Waveform::Sawtooth, 48_000, 256, 8);
        assert_eq!(table.table_index(0.0), 0);
        assert_eq!(table.table_index(20.0), 0);
        assert_eq!(table.table_index(12_000.0), 7);
        assert_eq!(table.table_index(20_000.0), 7);

        // Halfway through the third range.
        let min = dsp::to_midi(20.0);
        let per_table = (dsp::to_midi(12_000.0) - min) / 7.0;
        assert_eq!(table.table_index(dsp::to_freq(min + 2.5 * per_table)), 3);

        let mut previous = 0;
        for step in 0..200 {
            let index = table.table_index(20.0 * 1.035f32.powi(step));
            assert!(index >= previous);
            previous = index;
        }
    }

    #[test]
    fn harmonics_stay_below_nyquist() {
        let table = WaveTable::with_size(Waveform::Square, 48_000, 512, 10);
        let nyquist = 24_000.0;
        let last = table.num_tables() - 1;
        assert_eq!(table.max_harmonic(last), 1);
        assert!(table.max_harmonic(0) > table.max_harmonic(last - 1));

        // 20 Hz up to about 19 kHz.
        for step in 0..278 {
            let frequency = 20.0 * 1.025f32.powi(step);
            let index = table.table_index(frequency);
            let top = frequency * table.max_harmonic(index) as f32;
            assert!(
                top <= nyquist * 1.0001,
                "{frequency} Hz uses table {index} reaching {top} Hz"
            );
        }
    }

    #[test]
    fn tables_hold_only_their_harmonics() {
        let table = WaveTable::with_size(Waveform::Sawtooth, 48_000, 512, 10);
        let index = 5;
        let harmonics = table.max_harmonic(index);
        assert!(harmonics + 1 < 256);
        let cycle = table.table(index);

        assert!(harmonic_magnitude(cycle, 1) > 0.1);
        for k in harmonics + 1..(harmonics + 8).min(255) {
            assert!(harmonic_magnitude(cycle, k) < 1e-4, "harmonic {k} leaked");
        }
    }

    #[test]
    fn tables_are_normalized() {
        for waveform in [Waveform::Sine, Waveform::Square, Waveform::Sawtooth, Waveform::Triangle] {
            let table = WaveTable::with_size(waveform, 44_100, 256, 6);
            for index in 0..table.num_tables() {
                let peak = table.table(index).iter().fold(0.0f32, |p, s| p.max(s.abs()));
                assert_relative_eq!(peak, 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn lookup_interpolates_and_wraps() {
        let cycle = [0.0, 1.0, 0.0, -1.0];
        assert_relative_eq!(lookup(&cycle, 0.125), 0.5);
        assert_relative_eq!(lookup(&cycle, 0.875), -0.5);
        assert_relative_eq!(lookup(&cycle, 0.0), 0.0);
    }

    #[test]
    fn oscillator_renders_after_initialize() {
        let ctx = Context::new(
            ContextConfig::default()
                .with_sample_rate(48_000)
                .with_frames_per_block(64),
        );
        let out = ctx.make_node(NullOutput::new());
        ctx.set_target(&out).unwrap();
        let osc = ctx.make_node(
            WaveTableOsc::new(Waveform::Square, 1_000.0)
                .with_amplitude(0.5)
                .with_table_size(256, 8),
        );
        osc.connect(&out).unwrap();
        osc.start().unwrap();
        ctx.initialize().unwrap();
        ctx.start().unwrap();

        let block = ctx.render_block(|block| block.clone()).unwrap();
        let samples = block.channel(0);
        let peak = samples.iter().fold(0.0f32, |p, s| p.max(s.abs()));
        assert_relative_eq!(samples[0], 0.0, epsilon = 1e-6);
        assert!(peak > 0.4 && peak <= 0.5 + 1e-4, "peak {peak}");
        assert_eq!(block.channel(1), samples);
    }
}
