//! Host microphone capture feeding the 4-channel codec frame layout.
//!
//! The capture callback maps whatever channel count the host device offers
//! onto the headset layout (mic L, aux echo reference, mic R, boom
//! reference) and pushes interleaved frames into the ring. Devices that do
//! not run at 48 kHz are resampled in the callback with an FFT resampler.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use log::{info, warn};
use rubato::{FftFixedIn, Resampler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::buffer::AudioProducer;
use super::PlatformError;
use crate::engine::{NUM_CHANNELS_IN, SAMPLE_RATE};

/// Input stream handle; capturing stops when this is dropped.
pub struct HostCapture {
    stream: Stream,
    alive: Arc<AtomicBool>,
}

impl HostCapture {
    pub fn from_default_device(producer: AudioProducer) -> Result<Self, PlatformError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(PlatformError::NoDevice)?;
        Self::from_device(device, producer)
    }

    pub fn from_device(device: Device, producer: AudioProducer) -> Result<Self, PlatformError> {
        let name = device
            .name()
            .map_err(|e| PlatformError::DeviceName(e.to_string()))?;
        let config = device
            .default_input_config()
            .map_err(|e| PlatformError::DefaultConfig(e.to_string()))?;
        let device_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let stream_config: StreamConfig = config.into();

        info!("capture device: {name} ({channels} ch @ {device_rate} Hz)");

        let alive = Arc::new(AtomicBool::new(true));
        let producer = Arc::new(Mutex::new(producer));

        let stream = if device_rate == SAMPLE_RATE {
            Self::build_native_stream(&device, &stream_config, channels, producer, &alive)?
        } else {
            info!("capture runs at {device_rate} Hz; resampling to {SAMPLE_RATE} Hz");
            Self::build_resampled_stream(
                &device,
                &stream_config,
                channels,
                device_rate,
                producer,
                &alive,
            )?
        };

        Ok(Self { stream, alive })
    }

    fn build_native_stream(
        device: &Device,
        config: &StreamConfig,
        channels: usize,
        producer: Arc<Mutex<AudioProducer>>,
        alive: &Arc<AtomicBool>,
    ) -> Result<Stream, PlatformError> {
        let alive = Arc::clone(alive);
        let mut frame = [0.0f32; NUM_CHANNELS_IN];
        let mut scratch: Vec<f32> = Vec::new();
        device
            .build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut producer) = producer.try_lock() {
                        let frames = data.len() / channels;
                        if scratch.len() < frames * NUM_CHANNELS_IN {
                            scratch.resize(frames * NUM_CHANNELS_IN, 0.0);
                        }
                        for (i, chunk) in data.chunks_exact(channels).enumerate() {
                            map_channels(chunk, &mut frame);
                            scratch[i * NUM_CHANNELS_IN..(i + 1) * NUM_CHANNELS_IN]
                                .copy_from_slice(&frame);
                        }
                        producer.write_frames(&scratch[..frames * NUM_CHANNELS_IN], NUM_CHANNELS_IN);
                    }
                },
                move |err| {
                    warn!("capture stream error: {err}");
                    alive.store(false, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| PlatformError::BuildStream(e.to_string()))
    }

    fn build_resampled_stream(
        device: &Device,
        config: &StreamConfig,
        channels: usize,
        device_rate: u32,
        producer: Arc<Mutex<AudioProducer>>,
        alive: &Arc<AtomicBool>,
    ) -> Result<Stream, PlatformError> {
        let alive = Arc::clone(alive);
        const CHUNK: usize = 1024;
        let resampler = FftFixedIn::<f64>::new(
            device_rate as usize,
            SAMPLE_RATE as usize,
            CHUNK,
            2,
            2, // stereo; the boom reference is unavailable at foreign rates
        )
        .map_err(|e| PlatformError::Resampler(e.to_string()))?;

        let resampler = Arc::new(Mutex::new(resampler));
        let pending: Arc<Mutex<[Vec<f64>; 2]>> =
            Arc::new(Mutex::new([Vec::with_capacity(CHUNK * 2), Vec::with_capacity(CHUNK * 2)]));

        device
            .build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let Ok(mut pending) = pending.try_lock() else {
                        return;
                    };
                    for chunk in data.chunks_exact(channels) {
                        let left = chunk[0] as f64;
                        let right = if channels > 1 { chunk[1] as f64 } else { left };
                        pending[0].push(left);
                        pending[1].push(right);
                    }

                    let Ok(mut resampler) = resampler.try_lock() else {
                        return;
                    };
                    let needed = resampler.input_frames_next();
                    while pending[0].len() >= needed {
                        let input: Vec<Vec<f64>> = pending
                            .iter_mut()
                            .map(|ch| ch.drain(..needed).collect())
                            .collect();
                        if let Ok(output) = resampler.process(&input, None) {
                            if output.len() == 2 && !output[0].is_empty() {
                                if let Ok(mut producer) = producer.try_lock() {
                                    for (&l, &r) in output[0].iter().zip(output[1].iter()) {
                                        let frame = [l as f32, 0.0, r as f32, 0.0];
                                        producer.write_frames(&frame, NUM_CHANNELS_IN);
                                    }
                                }
                            }
                        }
                    }
                },
                move |err| {
                    warn!("capture stream error: {err}");
                    alive.store(false, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| PlatformError::BuildStream(e.to_string()))
    }

    pub fn start(&self) -> Result<(), PlatformError> {
        self.stream
            .play()
            .map_err(|e| PlatformError::PlayStream(e.to_string()))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

/// Map a host capture frame onto the headset layout. The aux echo reference
/// has no host equivalent and stays silent; the boom reference takes the
/// last extra channel when one exists.
fn map_channels(chunk: &[f32], frame: &mut [f32; NUM_CHANNELS_IN]) {
    let left = chunk[0];
    let right = if chunk.len() > 1 { chunk[1] } else { left };
    let boom = if chunk.len() > 2 {
        chunk[chunk.len() - 1]
    } else {
        0.0
    };
    frame[0] = left;
    frame[1] = 0.0;
    frame[2] = right;
    frame[3] = boom;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_channels_mono_duplicates_left() {
        let mut frame = [9.0f32; NUM_CHANNELS_IN];
        map_channels(&[0.5], &mut frame);
        assert_eq!(frame, [0.5, 0.0, 0.5, 0.0]);
    }

    #[test]
    fn test_map_channels_stereo() {
        let mut frame = [0.0f32; NUM_CHANNELS_IN];
        map_channels(&[0.1, -0.2], &mut frame);
        assert_eq!(frame, [0.1, 0.0, -0.2, 0.0]);
    }

    #[test]
    fn test_map_channels_multichannel_routes_boom() {
        let mut frame = [0.0f32; NUM_CHANNELS_IN];
        map_channels(&[0.1, 0.2, 0.3, 0.4], &mut frame);
        assert_eq!(frame, [0.1, 0.0, 0.2, 0.4]);
    }
}
