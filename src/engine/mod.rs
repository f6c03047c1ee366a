//! Engine core: parameter exchange, codec and helper contracts, and the
//! per-block DSP pipeline driver.

pub mod bridge;
pub mod codec;
pub mod helpers;
pub mod params;
pub mod processor;

/// Internal processing rate.
pub const SAMPLE_RATE: u32 = 48_000;

/// Samples per block and channel: 10 ms at 48 kHz.
pub const BLOCK_SIZE: usize = 480;

/// Codec capture layout: mic L, aux echo reference, mic R, boom reference.
pub const NUM_CHANNELS_IN: usize = 4;

/// Headphone output is stereo.
pub const NUM_CHANNELS_OUT: usize = 2;

pub use bridge::AecFrameBridge;
pub use codec::{Codec, CodecError};
pub use helpers::{
    AecProcessor, AgcProcessor, HelperError, HelperSuite, NsProcessor, NullHelperSuite,
    VadDetector, AEC_FRAME, HELPER_SAMPLE_RATE, NS_FRAME,
};
pub use params::{
    AgcParams, EngineParams, EqParams, FilterParams, Levels, NsParams, OutputParams, VeMode,
    VoiceExclusionParams, EQ_FREQUENCIES, EQ_Q,
};
pub use processor::{AudioEngine, EngineError};
