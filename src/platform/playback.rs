//! Host headphone playback draining the stereo output ring.
//!
//! Underruns emit silence and are counted instead of blocking the callback.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::buffer::AudioConsumer;
use super::PlatformError;
use crate::engine::SAMPLE_RATE;

/// Output stream handle; playback stops when this is dropped.
pub struct HostPlayback {
    stream: Stream,
    alive: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
}

impl HostPlayback {
    pub fn from_default_device(consumer: AudioConsumer) -> Result<Self, PlatformError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(PlatformError::NoDevice)?;
        Self::from_device(device, consumer)
    }

    pub fn from_device(device: Device, consumer: AudioConsumer) -> Result<Self, PlatformError> {
        let name = device
            .name()
            .map_err(|e| PlatformError::DeviceName(e.to_string()))?;

        let supported = device
            .supported_output_configs()
            .map_err(|e| PlatformError::DefaultConfig(e.to_string()))?;
        let config = find_48k_config(supported)
            .or_else(|| device.default_output_config().ok())
            .ok_or_else(|| {
                PlatformError::DefaultConfig("no usable output configuration".into())
            })?;

        let device_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        if device_rate != SAMPLE_RATE {
            warn!("output device runs at {device_rate} Hz; playback will be rate-skewed");
        }
        info!("playback device: {name} ({channels} ch @ {device_rate} Hz)");

        let stream_config: StreamConfig = config.into();
        let alive = Arc::new(AtomicBool::new(true));
        let underruns = Arc::new(AtomicU64::new(0));
        let consumer = Arc::new(Mutex::new(consumer));

        let callback_alive = Arc::clone(&alive);
        let callback_underruns = Arc::clone(&underruns);
        let mut stereo: Vec<f32> = Vec::new();

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    if stereo.len() < frames * 2 {
                        stereo.resize(frames * 2, 0.0);
                    }

                    let got = match consumer.try_lock() {
                        Ok(mut consumer) => consumer.read(&mut stereo[..frames * 2]),
                        Err(_) => 0,
                    };
                    if got < frames * 2 {
                        stereo[got..frames * 2].fill(0.0);
                        callback_underruns.fetch_add(1, Ordering::Relaxed);
                    }

                    for (frame, out) in stereo[..frames * 2]
                        .chunks_exact(2)
                        .zip(data.chunks_exact_mut(channels))
                    {
                        match channels {
                            1 => out[0] = (frame[0] + frame[1]) * 0.5,
                            _ => {
                                out[0] = frame[0];
                                out[1] = frame[1];
                                for extra in out.iter_mut().skip(2) {
                                    *extra = 0.0;
                                }
                            }
                        }
                    }
                },
                move |err| {
                    warn!("playback stream error: {err}");
                    callback_alive.store(false, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| PlatformError::BuildStream(e.to_string()))?;

        Ok(Self {
            stream,
            alive,
            underruns,
        })
    }

    pub fn start(&self) -> Result<(), PlatformError> {
        self.stream
            .play()
            .map_err(|e| PlatformError::PlayStream(e.to_string()))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

/// Prefer an explicit 48 kHz stereo-capable configuration.
fn find_48k_config(
    configs: impl Iterator<Item = SupportedStreamConfigRange>,
) -> Option<cpal::SupportedStreamConfig> {
    let target = SampleRate(SAMPLE_RATE);
    configs
        .filter(|range| range.min_sample_rate() <= target && range.max_sample_rate() >= target)
        .max_by_key(|range| range.channels())
        .map(|range| range.with_sample_rate(target))
}
