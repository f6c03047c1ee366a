//! Sample-rate-independent signal sources for the masking layer: a fast
//! xorshift noise generator, pink/brown spectral shapers, and a
//! phase-continuous sine oscillator.

use std::f32::consts::TAU;

/// xorshift64* pseudorandom source. Not cryptographic; fast enough to run
/// twice per sample inside the audio loop.
#[derive(Clone, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E3779B97F4A7C15 } else { seed },
        }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform sample in [-1.0, 1.0).
    #[inline]
    pub fn next_bipolar(&mut self) -> f32 {
        let mantissa = (self.next_u64() >> 40) as f32; // 24 bits
        mantissa / 8_388_608.0 - 1.0
    }
}

/// Pink shaper: chain of summed decaying accumulators driven from white
/// noise, -3 dB/octave over the audio band.
#[derive(Clone, Copy, Debug, Default)]
pub struct PinkShaper {
    b0: f32,
    b1: f32,
    b2: f32,
}

impl PinkShaper {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub fn process(&mut self, white: f32) -> f32 {
        self.b0 = 0.99765 * self.b0 + white * 0.0990460;
        self.b1 = 0.96300 * self.b1 + white * 0.2965164;
        self.b2 = 0.57000 * self.b2 + white * 1.0526913;
        (self.b0 + self.b1 + self.b2 + white * 0.1848) * 0.2
    }
}

/// Brown shaper: first-order leaky integration of white noise,
/// -6 dB/octave.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrownShaper {
    acc: f32,
}

impl BrownShaper {
    pub fn reset(&mut self) {
        self.acc = 0.0;
    }

    #[inline]
    pub fn process(&mut self, white: f32) -> f32 {
        self.acc = (self.acc + 0.02 * white) * 0.997;
        (self.acc * 3.0).clamp(-1.0, 1.0)
    }
}

/// Sine oscillator that keeps phase across blocks so frequency changes and
/// block boundaries never click.
#[derive(Clone, Copy, Debug, Default)]
pub struct Oscillator {
    phase: f32,
}

impl Oscillator {
    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    /// Produce the next sample of `sin(2*pi*frequency*t)`.
    #[inline]
    pub fn next(&mut self, frequency: f32, sample_rate: f32) -> f32 {
        let value = self.phase.sin();
        self.phase += TAU * frequency / sample_rate;
        if self.phase >= TAU {
            self.phase -= TAU;
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_bipolar_range_and_variation() {
        let mut rng = XorShift64::new(42);
        let mut min = 1.0f32;
        let mut max = -1.0f32;
        for _ in 0..10000 {
            let v = rng.next_bipolar();
            assert!((-1.0..1.0).contains(&v));
            min = min.min(v);
            max = max.max(v);
        }
        assert!(min < -0.9 && max > 0.9, "poor coverage: [{min}, {max}]");
    }

    #[test]
    fn test_xorshift_zero_seed_is_coerced() {
        let mut rng = XorShift64::new(0);
        let a = rng.next_bipolar();
        let b = rng.next_bipolar();
        assert_ne!(a, b);
    }

    #[test]
    fn test_pink_and_brown_stay_bounded() {
        let mut rng = XorShift64::new(9);
        let mut pink = PinkShaper::default();
        let mut brown = BrownShaper::default();
        for _ in 0..100_000 {
            let w = rng.next_bipolar();
            let p = pink.process(w);
            let b = brown.process(w);
            assert!(p.abs() <= 1.5, "pink out of range: {p}");
            assert!(b.abs() <= 1.0, "brown out of range: {b}");
        }
    }

    #[test]
    fn test_brown_has_less_high_frequency_energy_than_white() {
        // First difference energy is a cheap proxy for HF content.
        let mut rng = XorShift64::new(5);
        let mut brown = BrownShaper::default();
        let mut white_diff = 0.0f64;
        let mut brown_diff = 0.0f64;
        let mut prev_w = 0.0f32;
        let mut prev_b = 0.0f32;
        for _ in 0..50_000 {
            let w = rng.next_bipolar();
            let b = brown.process(w);
            white_diff += ((w - prev_w) as f64).powi(2);
            brown_diff += ((b - prev_b) as f64).powi(2);
            prev_w = w;
            prev_b = b;
        }
        assert!(brown_diff < white_diff * 0.1);
    }

    #[test]
    fn test_oscillator_phase_continuity_across_calls() {
        let mut split = Oscillator::default();
        let mut whole = Oscillator::default();

        let mut split_out = Vec::new();
        for _ in 0..100 {
            split_out.push(split.next(440.0, 48000.0));
        }
        for _ in 0..100 {
            split_out.push(split.next(440.0, 48000.0));
        }
        let whole_out: Vec<f32> = (0..200).map(|_| whole.next(440.0, 48000.0)).collect();
        assert_eq!(split_out, whole_out);
    }

    #[test]
    fn test_oscillator_frequency() {
        // Count zero crossings of a 1 kHz tone over 48000 samples.
        let mut osc = Oscillator::default();
        let mut crossings = 0;
        let mut prev = osc.next(1000.0, 48000.0);
        for _ in 0..48000 {
            let v = osc.next(1000.0, 48000.0);
            if prev <= 0.0 && v > 0.0 {
                crossings += 1;
            }
            prev = v;
        }
        assert!((995..=1005).contains(&crossings), "{crossings} crossings");
    }
}
