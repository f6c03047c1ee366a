//! Capability interfaces for the external 16 kHz DSP helpers (noise
//! suppression, AGC, acoustic echo cancellation, voice activity detection).
//!
//! The engine is polymorphic over any provider that satisfies these
//! interfaces, which is what allows the platform helpers to be replaced
//! with pure test doubles. Handles are opened on demand by the worker when
//! a feature is enabled, reopened when an identity-defining parameter
//! changes, and dropped on disable and at stop.

use thiserror::Error;

/// Sample rate all helpers operate at.
pub const HELPER_SAMPLE_RATE: u32 = 16_000;

/// NS/AGC streaming chunk: 10 ms at 16 kHz.
pub const NS_FRAME: usize = 160;

/// AEC frame size; the frame bridge accumulates across block boundaries.
pub const AEC_FRAME: usize = 512;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("failed to create {kind} helper: {reason}")]
    Create { kind: &'static str, reason: String },

    #[error("{kind} helper processing failed: {reason}")]
    Process { kind: &'static str, reason: String },

    #[error("{0} helper not provided on this platform")]
    Unsupported(&'static str),
}

/// Streaming noise suppressor working on [`NS_FRAME`]-sample chunks.
pub trait NsProcessor: Send {
    fn process(&mut self, input: &[i16], output: &mut [i16]) -> Result<(), HelperError>;
}

/// Automatic gain control working on [`NS_FRAME`]-sample chunks.
pub trait AgcProcessor: Send {
    fn set_config(
        &mut self,
        compression_gain_db: u8,
        limiter_enabled: bool,
        target_level_dbfs: i8,
    ) -> Result<(), HelperError>;

    fn process(&mut self, input: &[i16], output: &mut [i16]) -> Result<(), HelperError>;
}

/// Acoustic echo canceller working on [`AEC_FRAME`]-sample frames.
pub trait AecProcessor: Send {
    fn process(
        &mut self,
        primary: &[i16],
        reference: &[i16],
        output: &mut [i16],
    ) -> Result<(), HelperError>;
}

/// Voice activity detector classifying one frame at 16 kHz.
pub trait VadDetector: Send {
    fn is_speech(&mut self, frame: &[i16]) -> Result<bool, HelperError>;
}

/// Factory for helper handles. One suite is attached to the engine for its
/// whole lifetime; handle lifetimes are managed by the worker.
pub trait HelperSuite: Send + Sync {
    fn create_ns(&self, frame_size: usize, mode: u8) -> Result<Box<dyn NsProcessor>, HelperError>;

    fn create_agc(&self, mode: u8) -> Result<Box<dyn AgcProcessor>, HelperError>;

    fn create_aec(&self, filter_length: u8, mode: u8)
        -> Result<Box<dyn AecProcessor>, HelperError>;

    fn create_vad(&self, mode: u8) -> Result<Box<dyn VadDetector>, HelperError>;
}

/// Suite for hosts without platform DSP libraries: every create fails, so
/// the dependent features simply stay off at runtime.
pub struct NullHelperSuite;

impl HelperSuite for NullHelperSuite {
    fn create_ns(&self, _frame_size: usize, _mode: u8) -> Result<Box<dyn NsProcessor>, HelperError> {
        Err(HelperError::Unsupported("NS"))
    }

    fn create_agc(&self, _mode: u8) -> Result<Box<dyn AgcProcessor>, HelperError> {
        Err(HelperError::Unsupported("AGC"))
    }

    fn create_aec(
        &self,
        _filter_length: u8,
        _mode: u8,
    ) -> Result<Box<dyn AecProcessor>, HelperError> {
        Err(HelperError::Unsupported("AEC"))
    }

    fn create_vad(&self, _mode: u8) -> Result<Box<dyn VadDetector>, HelperError> {
        Err(HelperError::Unsupported("VAD"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_suite_refuses_all_helpers() {
        let suite = NullHelperSuite;
        assert!(suite.create_ns(NS_FRAME, 1).is_err());
        assert!(suite.create_agc(0).is_err());
        assert!(suite.create_aec(4, 0).is_err());
        assert!(suite.create_vad(2).is_err());
    }
}
