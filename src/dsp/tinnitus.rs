//! Tinnitus relief layer: notch bank, masking-noise generator, pure-tone
//! finder, high-frequency shelf extension, and binaural beats.
//!
//! The layer sits between the enhancement chain and the output gain. The
//! notch bank can optionally be moved ahead of the EQ instead via
//! [`NotchStage`].

use crate::dsp::biquad::{Biquad, Coeffs};
use crate::dsp::noise::{BrownShaper, Oscillator, PinkShaper, XorShift64};

/// Number of configurable notch filters per channel.
pub const NUM_NOTCHES: usize = 6;

/// Masking noise spectrum selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NoiseType {
    #[default]
    Off,
    White,
    Pink,
    Brown,
}

/// Where the notch bank runs relative to the 3-band EQ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NotchStage {
    /// Ahead of the EQ, so EQ boosts cannot re-excite a notched band.
    PreEq,
    /// After the EQ and the 16 kHz helpers, just before output gain.
    #[default]
    PostEq,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NotchParams {
    pub enabled: bool,
    pub frequency: f32,
    pub q: f32,
}

impl Default for NotchParams {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: 4000.0,
            q: 8.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskingParams {
    pub noise_type: NoiseType,
    pub level: f32,
    pub low_cut: f32,
    pub high_cut: f32,
}

impl Default for MaskingParams {
    fn default() -> Self {
        Self {
            noise_type: NoiseType::Off,
            level: 0.1,
            low_cut: 500.0,
            high_cut: 8000.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToneParams {
    pub enabled: bool,
    pub frequency: f32,
    pub level: f32,
}

impl Default for ToneParams {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: 4000.0,
            level: 0.1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HfExtensionParams {
    pub enabled: bool,
    pub frequency: f32,
    pub gain_db: f32,
}

impl Default for HfExtensionParams {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: 6000.0,
            gain_db: 6.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BinauralParams {
    pub enabled: bool,
    pub carrier: f32,
    pub beat: f32,
    pub level: f32,
}

impl Default for BinauralParams {
    fn default() -> Self {
        Self {
            enabled: false,
            carrier: 440.0,
            beat: 8.0,
            level: 0.1,
        }
    }
}

/// Complete tinnitus layer configuration.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct TinnitusParams {
    pub notches: [NotchParams; NUM_NOTCHES],
    pub notch_stage: NotchStage,
    pub masking: MaskingParams,
    pub tone: ToneParams,
    pub hf_extension: HfExtensionParams,
    pub binaural: BinauralParams,
}

/// Stateful realization of [`TinnitusParams`] for one stereo pair.
pub struct TinnitusLayer {
    params: TinnitusParams,
    sample_rate: f32,

    notch_left: [Biquad; NUM_NOTCHES],
    notch_right: [Biquad; NUM_NOTCHES],

    noise_rng: XorShift64,
    pink_left: PinkShaper,
    pink_right: PinkShaper,
    brown_left: BrownShaper,
    brown_right: BrownShaper,
    noise_hpf_left: Biquad,
    noise_hpf_right: Biquad,
    noise_lpf_left: Biquad,
    noise_lpf_right: Biquad,

    tone_osc: Oscillator,
    binaural_left: Oscillator,
    binaural_right: Oscillator,

    shelf_left: Biquad,
    shelf_right: Biquad,
}

impl TinnitusLayer {
    pub fn new(sample_rate: f32) -> Self {
        let mut layer = Self {
            params: TinnitusParams::default(),
            sample_rate,
            notch_left: Default::default(),
            notch_right: Default::default(),
            noise_rng: XorShift64::new(0xA0D10),
            pink_left: PinkShaper::default(),
            pink_right: PinkShaper::default(),
            brown_left: BrownShaper::default(),
            brown_right: BrownShaper::default(),
            noise_hpf_left: Biquad::default(),
            noise_hpf_right: Biquad::default(),
            noise_lpf_left: Biquad::default(),
            noise_lpf_right: Biquad::default(),
            tone_osc: Oscillator::default(),
            binaural_left: Oscillator::default(),
            binaural_right: Oscillator::default(),
            shelf_left: Biquad::default(),
            shelf_right: Biquad::default(),
        };
        layer.configure(&TinnitusParams::default());
        layer
    }

    /// Rebuild all coefficients from a parameter snapshot. Filter and
    /// oscillator state is preserved.
    pub fn configure(&mut self, params: &TinnitusParams) {
        let fs = self.sample_rate as f64;

        for (i, notch) in params.notches.iter().enumerate() {
            let coeffs = if notch.enabled {
                Coeffs::notch(notch.frequency as f64, notch.q as f64, fs)
            } else {
                Coeffs::IDENTITY
            };
            self.notch_left[i].set_coeffs(coeffs);
            self.notch_right[i].set_coeffs(coeffs);
        }

        let hpf = Coeffs::high_pass(params.masking.low_cut as f64, fs);
        let lpf = Coeffs::low_pass(params.masking.high_cut as f64, fs);
        self.noise_hpf_left.set_coeffs(hpf);
        self.noise_hpf_right.set_coeffs(hpf);
        self.noise_lpf_left.set_coeffs(lpf);
        self.noise_lpf_right.set_coeffs(lpf);

        let shelf = if params.hf_extension.enabled {
            Coeffs::high_shelf(
                params.hf_extension.frequency as f64,
                params.hf_extension.gain_db as f64,
                fs,
            )
        } else {
            Coeffs::IDENTITY
        };
        self.shelf_left.set_coeffs(shelf);
        self.shelf_right.set_coeffs(shelf);

        self.params = *params;
    }

    pub fn notch_stage(&self) -> NotchStage {
        self.params.notch_stage
    }

    pub fn reset(&mut self) {
        for notch in self.notch_left.iter_mut().chain(self.notch_right.iter_mut()) {
            notch.reset();
        }
        self.pink_left.reset();
        self.pink_right.reset();
        self.brown_left.reset();
        self.brown_right.reset();
        self.noise_hpf_left.reset();
        self.noise_hpf_right.reset();
        self.noise_lpf_left.reset();
        self.noise_lpf_right.reset();
        self.tone_osc.reset();
        self.binaural_left.reset();
        self.binaural_right.reset();
        self.shelf_left.reset();
        self.shelf_right.reset();
    }

    /// Run the notch bank over a stereo block.
    pub fn process_notches(&mut self, left: &mut [f32], right: &mut [f32]) {
        for i in 0..NUM_NOTCHES {
            self.notch_left[i].process_block(left);
            self.notch_right[i].process_block(right);
        }
    }

    /// Apply the HF shelf and add the synthesized sources (masking noise,
    /// tone, binaural beats) to a stereo block.
    pub fn process_synthesis(&mut self, left: &mut [f32], right: &mut [f32]) {
        let p = self.params;
        let fs = self.sample_rate;

        if p.hf_extension.enabled {
            self.shelf_left.process_block(left);
            self.shelf_right.process_block(right);
        }

        let masking = p.masking.noise_type != NoiseType::Off && p.masking.level > 0.0;
        let tone = p.tone.enabled && p.tone.level > 0.0;
        let binaural = p.binaural.enabled && p.binaural.level > 0.0;
        if !masking && !tone && !binaural {
            return;
        }

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            if masking {
                // Independent draws per channel keep the masker decorrelated.
                let wl = self.noise_rng.next_bipolar();
                let wr = self.noise_rng.next_bipolar();
                let (nl, nr) = match p.masking.noise_type {
                    NoiseType::White => (wl, wr),
                    NoiseType::Pink => (self.pink_left.process(wl), self.pink_right.process(wr)),
                    NoiseType::Brown => {
                        (self.brown_left.process(wl), self.brown_right.process(wr))
                    }
                    NoiseType::Off => unreachable!(),
                };
                let nl = self.noise_lpf_left.process(self.noise_hpf_left.process(nl));
                let nr = self
                    .noise_lpf_right
                    .process(self.noise_hpf_right.process(nr));
                *l += nl * p.masking.level;
                *r += nr * p.masking.level;
            }
            if tone {
                let s = self.tone_osc.next(p.tone.frequency, fs) * p.tone.level;
                *l += s;
                *r += s;
            }
            if binaural {
                *l += self.binaural_left.next(p.binaural.carrier, fs) * p.binaural.level;
                *r += self
                    .binaural_right
                    .next(p.binaural.carrier + p.binaural.beat, fs)
                    * p.binaural.level;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn tone_block(frequency: f32, offset: usize, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (TAU * frequency * (offset + i) as f32 / 48000.0).sin() * 0.5)
            .collect()
    }

    fn rms(block: &[f32]) -> f32 {
        (block.iter().map(|&s| s * s).sum::<f32>() / block.len() as f32).sqrt()
    }

    #[test]
    fn test_disabled_layer_is_passthrough() {
        let mut layer = TinnitusLayer::new(48000.0);
        let mut left = tone_block(1000.0, 0, 480);
        let mut right = left.clone();
        let expected = left.clone();
        layer.process_notches(&mut left, &mut right);
        layer.process_synthesis(&mut left, &mut right);
        assert_eq!(left, expected);
        assert_eq!(right, expected);
    }

    #[test]
    fn test_notch_attenuates_matching_tone() {
        let mut params = TinnitusParams::default();
        params.notches[0] = NotchParams {
            enabled: true,
            frequency: 4000.0,
            q: 8.0,
        };
        let mut layer = TinnitusLayer::new(48000.0);
        layer.configure(&params);

        let mut input_rms = 0.0;
        let mut output_rms = 0.0;
        for block in 0..40 {
            let mut left = tone_block(4000.0, block * 480, 480);
            let mut right = left.clone();
            input_rms = rms(&left);
            layer.process_notches(&mut left, &mut right);
            output_rms = rms(&left);
        }
        assert!(
            output_rms < input_rms * 0.05,
            "notch left {output_rms} of {input_rms}"
        );
    }

    #[test]
    fn test_notch_spares_distant_tone() {
        let mut params = TinnitusParams::default();
        params.notches[0] = NotchParams {
            enabled: true,
            frequency: 8000.0,
            q: 8.0,
        };
        let mut layer = TinnitusLayer::new(48000.0);
        layer.configure(&params);

        let mut input_rms = 0.0;
        let mut output_rms = 0.0;
        for block in 0..40 {
            let mut left = tone_block(500.0, block * 480, 480);
            let mut right = left.clone();
            input_rms = rms(&left);
            layer.process_notches(&mut left, &mut right);
            output_rms = rms(&left);
        }
        assert!((output_rms / input_rms - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_masking_noise_fills_silence() {
        let mut params = TinnitusParams::default();
        params.masking = MaskingParams {
            noise_type: NoiseType::Pink,
            level: 0.3,
            low_cut: 500.0,
            high_cut: 6000.0,
        };
        let mut layer = TinnitusLayer::new(48000.0);
        layer.configure(&params);

        let mut left = vec![0.0f32; 480];
        let mut right = vec![0.0f32; 480];
        for _ in 0..10 {
            layer.process_synthesis(&mut left, &mut right);
        }
        assert!(rms(&left) > 1e-3);
        assert!(rms(&right) > 1e-3);
        // Channels are decorrelated.
        assert_ne!(left, right);
    }

    #[test]
    fn test_binaural_channels_differ_in_frequency() {
        let mut params = TinnitusParams::default();
        params.binaural = BinauralParams {
            enabled: true,
            carrier: 400.0,
            beat: 10.0,
            level: 0.5,
        };
        let mut layer = TinnitusLayer::new(48000.0);
        layer.configure(&params);

        let mut left = vec![0.0f32; 48000];
        let mut right = vec![0.0f32; 48000];
        layer.process_synthesis(&mut left, &mut right);

        let crossings = |s: &[f32]| {
            s.windows(2)
                .filter(|w| w[0] <= 0.0 && w[1] > 0.0)
                .count() as i64
        };
        let diff = crossings(&right) - crossings(&left);
        assert!((8..=12).contains(&diff), "beat offset {diff} Hz");
    }

    #[test]
    fn test_tone_finder_is_mono() {
        let mut params = TinnitusParams::default();
        params.tone = ToneParams {
            enabled: true,
            frequency: 6000.0,
            level: 0.4,
        };
        let mut layer = TinnitusLayer::new(48000.0);
        layer.configure(&params);

        let mut left = vec![0.0f32; 480];
        let mut right = vec![0.0f32; 480];
        layer.process_synthesis(&mut left, &mut right);
        assert_eq!(left, right);
        assert!(rms(&left) > 0.2);
    }

    #[test]
    fn test_hf_extension_boosts_high_band() {
        let mut params = TinnitusParams::default();
        params.hf_extension = HfExtensionParams {
            enabled: true,
            frequency: 4000.0,
            gain_db: 9.0,
        };
        let mut layer = TinnitusLayer::new(48000.0);
        layer.configure(&params);

        let mut out_rms = 0.0;
        let mut in_rms = 0.0;
        for block in 0..20 {
            let mut left = tone_block(12000.0, block * 480, 480);
            let mut right = left.clone();
            in_rms = rms(&left);
            layer.process_synthesis(&mut left, &mut right);
            out_rms = rms(&left);
        }
        let gain_db = 20.0 * (out_rms / in_rms).log10();
        assert!((gain_db - 9.0).abs() < 1.5, "shelf gain {gain_db} dB");
    }
}
