//! Block mixing helpers and unit conversions.

use itertools::izip;

use crate::buffer::Buffer;

/// Whether a block of `from` channels can be mixed into `to` channels:
/// equal counts, or either side mono.
#[inline]
pub fn channels_mixable(from: usize, to: usize) -> bool {
    from == to || from == 1 || to == 1
}

/// Add `source` into `dest`, broadcasting a mono source to every channel and
/// averaging a multichannel source down to mono.
pub fn sum_into(source: &Buffer, dest: &mut Buffer) {
    let frames = source.num_frames().min(dest.num_frames());
    let (from, to) = (source.num_channels(), dest.num_channels());

    if from == to {
        for (d, s) in dest.channels_mut().zip(source.channels()) {
            add(&s[..frames], &mut d[..frames]);
        }
    } else if from == 1 {
        let s = &source.channel(0)[..frames];
        for d in dest.channels_mut() {
            add(s, &mut d[..frames]);
        }
    } else if to == 1 {
        let scale = 1.0 / from as f32;
        let d = &mut dest.channel_mut(0)[..frames];
        for s in source.channels() {
            for (out, sample) in izip!(d.iter_mut(), &s[..frames]) {
                *out += sample * scale;
            }
        }
    } else {
        for (d, s) in dest.channels_mut().zip(source.channels()) {
            add(&s[..frames], &mut d[..frames]);
        }
    }
}

/// Overwrite `dest` with `source`, with the same channel rules as
/// [`sum_into`].
pub fn mix_into(source: &Buffer, dest: &mut Buffer) {
    if source.num_channels() == dest.num_channels() && source.len() == dest.len() {
        dest.copy_from(source);
        return;
    }
    dest.zero();
    sum_into(source, dest);
}

/// Multiply every channel of `buffer` by a per-frame gain curve.
pub fn multiply_by_curve(buffer: &mut Buffer, curve: &[f32]) {
    for channel in buffer.channels_mut() {
        for (sample, gain) in izip!(channel.iter_mut(), curve) {
            *sample *= gain;
        }
    }
}

/// Multiply every sample of `buffer` by `gain`.
#[inline]
pub fn multiply(buffer: &mut Buffer, gain: f32) {
    buffer.data_mut().iter_mut().for_each(|s| *s *= gain);
}

#[inline]
fn add(source: &[f32], dest: &mut [f32]) {
    for (d, s) in izip!(dest.iter_mut(), source) {
        *d += s;
    }
}

/// Root mean square of a slice; zero for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Scale `samples` so the largest magnitude is 1. Silence is left alone.
pub fn normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
    if peak > 0.0 {
        samples.iter_mut().for_each(|s| *s /= peak);
    }
}

/// Linear gain to decibels on a 0..100 dB scale where 100 dB is unity and
/// anything at or below -100 dBFS maps to 0.
pub fn to_decibels(gain: f32) -> f32 {
    const MIN_GAIN: f32 = 1e-5;
    if gain < MIN_GAIN {
        0.0
    } else {
        100.0 + 20.0 * gain.log10()
    }
}

/// Inverse of [`to_decibels`].
pub fn to_linear(decibels: f32) -> f32 {
    if decibels <= 0.0 {
        0.0
    } else {
        10f32.powf((decibels - 100.0) / 20.0)
    }
}

/// Frequency in Hz to a (fractional) MIDI note number.
pub fn to_midi(frequency: f32) -> f32 {
    if frequency <= 0.0 {
        return 0.0;
    }
    69.0 + 12.0 * (frequency / 440.0).log2()
}

/// MIDI note number to frequency in Hz.
pub fn to_freq(midi: f32) -> f32 {
    440.0 * 2f32.powf((midi - 69.0) / 12.0)
}

#[inline]
pub fn is_power_of_two(value: usize) -> bool {
    value.is_power_of_two()
}
