//! Auricle Core - real-time audio enhancement engine for a headset device
//!
//! Pipeline per 10 ms block: 4-channel codec read -> HPF/LPF -> 3-band EQ ->
//! reference conditioning -> voice exclusion (NLMS or external AEC) ->
//! noise suppression -> AGC -> tinnitus layer -> output gain -> metering ->
//! stereo codec write.

pub mod dsp;
pub mod engine;
pub mod platform;

// Re-export the main types
pub use engine::{
    AudioEngine, Codec, CodecError, EngineError, EngineParams, HelperSuite, Levels,
    NullHelperSuite, VeMode,
};
pub use platform::{HostCodec, PlatformError};
