//! Codec capability contract consumed by the engine.
//!
//! The embedded target implements this over its board support package; hosts
//! use [`crate::platform::HostCodec`]; tests use scripted doubles. The
//! blocking `read` is the timing pacemaker of the DSP loop, so
//! implementations should return a short read (`Ok(0)`) within a few blocks
//! rather than blocking indefinitely, or `stop()` cannot reclaim the worker.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("codec unavailable: {0}")]
    Unavailable(String),

    #[error("failed to reconfigure codec: {0}")]
    Reconfigure(String),

    #[error("codec read failed: {0}")]
    Read(String),

    #[error("codec write failed: {0}")]
    Write(String),
}

/// Full-duplex audio codec with input gain, volume, and mute control.
///
/// Input side delivers 4-channel interleaved 16-bit PCM at 48 kHz
/// (mic L, aux echo reference, mic R, headphone-boom reference); output side
/// accepts 2-channel interleaved 16-bit PCM at 48 kHz.
pub trait Codec: Send {
    /// Reconfigure the I2S clocking. Called once at worker entry.
    fn reconfigure(
        &mut self,
        sample_rate: u32,
        bits_per_sample: u16,
        stereo: bool,
    ) -> Result<(), CodecError>;

    /// Blocking read of interleaved input samples. Returns the number of
    /// i16 samples written into `buf`; `Ok(0)` is a short read and skips the
    /// iteration.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, CodecError>;

    /// Blocking write of interleaved stereo samples. Returns the number of
    /// i16 samples consumed.
    fn write(&mut self, buf: &[i16]) -> Result<usize, CodecError>;

    /// Microphone PGA, 0..=240 codec units.
    fn set_input_gain(&mut self, gain: f32);

    /// Playback volume, 0..=100.
    fn set_volume(&mut self, volume: u8);

    /// Hard output mute at the codec.
    fn set_mute(&mut self, mute: bool);

    /// Speaker amplifier control; the engine disables the amp while running
    /// to prevent feedback into the headset mics.
    fn set_speaker_enabled(&mut self, enabled: bool);

    /// Headphone presence probe. Polled at most every 48 blocks.
    fn headphone_detected(&mut self) -> bool;
}
