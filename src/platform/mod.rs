//! Host platform adapter: a [`Codec`] implementation over cpal streams.
//!
//! This exists for development and bench testing on a workstation; the
//! headset's own codec driver lives with its board support package. Gain,
//! volume, and mute are applied in software here since host devices expose
//! no PGA.

pub mod buffer;
pub mod capture;
pub mod playback;

use log::{debug, warn};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::engine::codec::{Codec, CodecError};
use crate::engine::{BLOCK_SIZE, NUM_CHANNELS_IN, NUM_CHANNELS_OUT, SAMPLE_RATE};
use buffer::{AudioConsumer, AudioProducer, AudioRingBuffer};
use capture::HostCapture;
use playback::HostPlayback;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("no audio device found")]
    NoDevice,

    #[error("failed to get device name: {0}")]
    DeviceName(String),

    #[error("failed to get device config: {0}")]
    DefaultConfig(String),

    #[error("failed to build stream: {0}")]
    BuildStream(String),

    #[error("failed to start stream: {0}")]
    PlayStream(String),

    #[error("failed to create resampler: {0}")]
    Resampler(String),
}

/// Unity-gain point of the software input gain, matching the engine's
/// default PGA setting.
const UNITY_INPUT_GAIN: f32 = 180.0;

/// How long a blocking read waits before reporting a short read. Keeps the
/// worker responsive to `stop()` when the capture stream stalls.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// [`Codec`] over the default host input and output devices.
pub struct HostCodec {
    capture: HostCapture,
    playback: HostPlayback,
    capture_rx: AudioConsumer,
    playback_tx: AudioProducer,
    input_scale: f32,
    volume_scale: f32,
    muted: bool,
    scratch: Vec<f32>,
}

impl HostCodec {
    /// Open the default capture and playback devices and start streaming.
    pub fn new() -> Result<Self, PlatformError> {
        // Two seconds of headroom on either side.
        let capture_rb = AudioRingBuffer::new(SAMPLE_RATE as usize * NUM_CHANNELS_IN * 2);
        let (capture_tx, capture_rx) = capture_rb.split();
        let playback_rb = AudioRingBuffer::new(SAMPLE_RATE as usize * NUM_CHANNELS_OUT * 2);
        let (mut playback_tx, playback_rx) = playback_rb.split();

        // Prime the output with one silent block to absorb startup jitter.
        playback_tx.write(&[0.0; BLOCK_SIZE * NUM_CHANNELS_OUT]);

        let capture = HostCapture::from_default_device(capture_tx)?;
        let playback = HostPlayback::from_default_device(playback_rx)?;
        capture.start()?;
        playback.start()?;

        Ok(Self {
            capture,
            playback,
            capture_rx,
            playback_tx,
            input_scale: 1.0,
            volume_scale: 0.8,
            muted: true,
            scratch: vec![0.0; BLOCK_SIZE * NUM_CHANNELS_IN],
        })
    }

    pub fn underruns(&self) -> u64 {
        self.playback.underruns()
    }
}

impl Codec for HostCodec {
    fn reconfigure(
        &mut self,
        sample_rate: u32,
        bits_per_sample: u16,
        stereo: bool,
    ) -> Result<(), CodecError> {
        if sample_rate != SAMPLE_RATE || bits_per_sample != 16 || !stereo {
            return Err(CodecError::Reconfigure(format!(
                "host codec is fixed at {SAMPLE_RATE} Hz / 16-bit stereo, \
                 requested {sample_rate} Hz / {bits_per_sample}-bit"
            )));
        }
        if !self.capture.is_alive() {
            return Err(CodecError::Unavailable("capture stream died".into()));
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, CodecError> {
        let wanted = buf.len().min(self.scratch.len());
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut have = 0usize;

        while have < wanted {
            have += self.capture_rx.read(&mut self.scratch[have..wanted]);
            if have >= wanted {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_micros(500));
        }

        // Deliver whole frames only.
        let frames = have / NUM_CHANNELS_IN;
        let samples = frames * NUM_CHANNELS_IN;
        for (dst, &src) in buf[..samples].iter_mut().zip(self.scratch.iter()) {
            *dst = ((src * self.input_scale).clamp(-1.0, 1.0) * 32767.0) as i16;
        }
        Ok(samples)
    }

    fn write(&mut self, buf: &[i16]) -> Result<usize, CodecError> {
        if self.scratch.len() < buf.len() {
            self.scratch.resize(buf.len(), 0.0);
        }
        let scale = if self.muted { 0.0 } else { self.volume_scale };
        for (dst, &src) in self.scratch.iter_mut().zip(buf.iter()) {
            *dst = src as f32 / 32768.0 * scale;
        }
        let written = self
            .playback_tx
            .write_frames(&self.scratch[..buf.len()], NUM_CHANNELS_OUT);
        if written < buf.len() {
            debug!("playback ring full, dropped {} samples", buf.len() - written);
        }
        Ok(buf.len())
    }

    fn set_input_gain(&mut self, gain: f32) {
        self.input_scale = gain.clamp(0.0, 240.0) / UNITY_INPUT_GAIN;
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume_scale = volume.min(100) as f32 / 100.0;
    }

    fn set_mute(&mut self, mute: bool) {
        self.muted = mute;
    }

    fn set_speaker_enabled(&mut self, enabled: bool) {
        // Hosts have no speaker amplifier on the headphone path.
        debug!("speaker amp request ignored on host (enabled={enabled})");
    }

    fn headphone_detected(&mut self) -> bool {
        if !self.playback.is_alive() {
            warn!("playback stream died; reporting headphone absent");
            return false;
        }
        true
    }
}
