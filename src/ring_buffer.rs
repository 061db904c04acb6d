//! Single-producer/single-consumer sample ring buffer.
//!
//! A thin block-oriented layer over [`rtrb`]: writers push whole slices and
//! get back how many samples fit, readers pull into a slice and get back how
//! many were available. Neither side ever blocks or allocates.

use rtrb::chunks::ChunkError;

/// Constructor namespace for a ring buffer pair.
pub struct RingBuffer;

impl RingBuffer {
    /// Create a ring buffer holding up to `capacity` samples.
    ///
    /// ```
    /// use klanggraph::RingBuffer;
    ///
    /// let (mut writer, mut reader) = RingBuffer::new(8);
    /// assert_eq!(writer.write(&[1.0, 2.0, 3.0]), 3);
    ///
    /// let mut out = [0.0; 4];
    /// assert_eq!(reader.read(&mut out), 3);
    /// assert_eq!(&out[..3], &[1.0, 2.0, 3.0]);
    /// ```
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (RingWriter, RingReader) {
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        (RingWriter { producer }, RingReader { consumer })
    }
}

/// Writing half of a [`RingBuffer`].
pub struct RingWriter {
    producer: rtrb::Producer<f32>,
}

impl RingWriter {
    /// Write as many samples from `samples` as there is room for.
    ///
    /// Returns the number written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let count = samples.len().min(self.producer.slots());
        if count == 0 {
            return 0;
        }
        match self.producer.write_chunk(count) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&samples[..split]);
                second.copy_from_slice(&samples[split..count]);
                chunk.commit_all();
                count
            }
            Err(ChunkError::TooFewSlots(_)) => 0,
        }
    }

    /// Free space in samples.
    #[inline]
    pub fn available_write(&self) -> usize {
        self.producer.slots()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.producer.buffer().capacity()
    }

    /// Whether the reading half has been dropped.
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }
}

/// Reading half of a [`RingBuffer`].
pub struct RingReader {
    consumer: rtrb::Consumer<f32>,
}

impl RingReader {
    /// Read up to `out.len()` samples into `out`.
    ///
    /// Returns the number read; the rest of `out` is left untouched.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let count = out.len().min(self.consumer.slots());
        if count == 0 {
            return 0;
        }
        match self.consumer.read_chunk(count) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..count].copy_from_slice(second);
                chunk.commit_all();
                count
            }
            Err(ChunkError::TooFewSlots(_)) => 0,
        }
    }

    /// Drop up to `count` samples without copying them. Returns how many
    /// were dropped.
    pub fn skip(&mut self, count: usize) -> usize {
        let count = count.min(self.consumer.slots());
        if count == 0 {
            return 0;
        }
        match self.consumer.read_chunk(count) {
            Ok(chunk) => {
                chunk.commit_all();
                count
            }
            Err(ChunkError::TooFewSlots(_)) => 0,
        }
    }

    /// Drop everything currently readable.
    pub fn clear(&mut self) -> usize {
        self.skip(self.consumer.slots())
    }

    /// Samples ready to be read.
    #[inline]
    pub fn available_read(&self) -> usize {
        self.consumer.slots()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.consumer.buffer().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_preserves_order() {
        let (mut writer, mut reader) = RingBuffer::new(256);
        let samples: Vec<f32> = (0..200).map(|i| i as f32).collect();
        assert_eq!(writer.write(&samples), 200);

        let mut out = vec![0.0; 200];
        assert_eq!(reader.read(&mut out), 200);
        assert_eq!(out, samples);
    }

    #[test]
    fn write_stops_at_capacity() {
        let (mut writer, mut reader) = RingBuffer::new(4);
        assert_eq!(writer.write(&[1.0; 6]), 4);
        assert_eq!(writer.available_write(), 0);
        assert_eq!(writer.write(&[2.0]), 0);

        let mut out = [0.0; 8];
        assert_eq!(reader.read(&mut out), 4);
        assert_eq!(reader.read(&mut out), 0);
    }

    #[test]
    fn wraps_around_the_end() {
        let (mut writer, mut reader) = RingBuffer::new(5);
        let mut out = [0.0; 3];
        for round in 0..10 {
            let base = round as f32 * 3.0;
            assert_eq!(writer.write(&[base, base + 1.0, base + 2.0]), 3);
            assert_eq!(reader.read(&mut out), 3);
            assert_eq!(out, [base, base + 1.0, base + 2.0]);
        }
    }

    #[test]
    fn skip_and_clear_discard() {
        let (mut writer, mut reader) = RingBuffer::new(8);
        writer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(reader.skip(2), 2);

        let mut out = [0.0; 1];
        reader.read(&mut out);
        assert_eq!(out, [3.0]);

        assert_eq!(reader.clear(), 2);
        assert_eq!(reader.available_read(), 0);
    }
}
