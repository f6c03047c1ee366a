//! Lock-free ring buffer carrying interleaved audio between the cpal
//! callbacks and the blocking codec adapter.

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// SPSC sample ring with overrun accounting.
pub struct AudioRingBuffer {
    producer: HeapProducer<f32>,
    consumer: HeapConsumer<f32>,
    capacity: usize,
}

impl AudioRingBuffer {
    /// `capacity` is in samples (not frames).
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::<f32>::new(capacity);
        let (producer, consumer) = rb.split();
        Self {
            producer,
            consumer,
            capacity,
        }
    }

    pub fn split(self) -> (AudioProducer, AudioConsumer) {
        let dropped = Arc::new(AtomicU64::new(0));
        (
            AudioProducer {
                producer: self.producer,
                dropped: Arc::clone(&dropped),
            },
            AudioConsumer {
                consumer: self.consumer,
                capacity: self.capacity,
            },
        )
    }
}

/// Writing end, owned by the producing callback.
pub struct AudioProducer {
    producer: HeapProducer<f32>,
    dropped: Arc<AtomicU64>,
}

impl AudioProducer {
    /// Write as many samples as fit; the overflow is counted, not blocked on.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let written = self.producer.push_slice(samples);
        let dropped = samples.len() - written;
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        written
    }

    /// Write whole `frame_size`-sample frames only, so an overflowing ring
    /// can never tear a frame and rotate the channel layout for every
    /// subsequent reader.
    pub fn write_frames(&mut self, samples: &[f32], frame_size: usize) -> usize {
        let fit = (self.producer.free_len() / frame_size) * frame_size;
        let take = fit.min(samples.len() / frame_size * frame_size);
        let written = self.producer.push_slice(&samples[..take]);
        let dropped = samples.len() - written;
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        written
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

/// Reading end, owned by the consuming side.
pub struct AudioConsumer {
    consumer: HeapConsumer<f32>,
    capacity: usize,
}

impl AudioConsumer {
    /// Read up to `buffer.len()` samples; returns the count actually read.
    pub fn read(&mut self, buffer: &mut [f32]) -> usize {
        self.consumer.pop_slice(buffer)
    }

    pub fn len(&self) -> usize {
        self.consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_round_trip() {
        let (mut producer, mut consumer) = AudioRingBuffer::new(64).split();
        let data = [1.0f32, 2.0, 3.0, 4.0];
        assert_eq!(producer.write(&data), 4);

        let mut out = [0.0f32; 4];
        assert_eq!(consumer.read(&mut out), 4);
        assert_eq!(out, data);
    }

    #[test]
    fn test_write_frames_never_tears_a_frame() {
        let (mut producer, mut consumer) = AudioRingBuffer::new(10).split();
        // Capacity 10 holds two whole 4-sample frames; the third is dropped
        // entirely rather than split.
        let written = producer.write_frames(&[0.25f32; 12], 4);
        assert_eq!(written, 8);
        assert_eq!(producer.dropped_samples(), 4);

        let mut out = [0.0f32; 12];
        assert_eq!(consumer.read(&mut out), 8);
    }

    #[test]
    fn test_overflow_counts_dropped_samples() {
        let (mut producer, _consumer) = AudioRingBuffer::new(8).split();
        let written = producer.write(&[0.5f32; 20]);
        assert!(written <= 8);
        assert_eq!(producer.dropped_samples(), (20 - written) as u64);
    }

    #[test]
    fn test_read_from_empty_returns_zero() {
        let (_producer, mut consumer) = AudioRingBuffer::new(8).split();
        let mut out = [0.0f32; 4];
        assert_eq!(consumer.read(&mut out), 0);
        assert!(consumer.is_empty());
    }
}
