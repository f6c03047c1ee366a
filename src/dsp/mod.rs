//! Digital signal processing primitives

pub mod biquad;
pub mod meter;
pub mod nlms;
pub mod noise;
pub mod resampler;
pub mod tinnitus;

pub use biquad::{Biquad, Coeffs, BUTTERWORTH_Q};
pub use meter::{ChannelMeter, PEAK_DECAY};
pub use nlms::NlmsFilter;
pub use noise::{BrownShaper, Oscillator, PinkShaper, XorShift64};
pub use resampler::{Downsampler3, Upsampler3, FILTER_TAPS};
pub use tinnitus::{
    BinauralParams, HfExtensionParams, MaskingParams, NoiseType, NotchParams, NotchStage,
    TinnitusLayer, TinnitusParams, ToneParams, NUM_NOTCHES,
};
