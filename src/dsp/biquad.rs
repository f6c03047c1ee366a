//! IIR biquad filter using Direct Form II Transposed, plus the coefficient
//! calculator shared by every filter in the engine.
//!
//! Coefficients are computed with Robert Bristow-Johnson's Audio EQ Cookbook
//! formulas. They use f64 internally to avoid numerical issues; audio samples
//! stay f32 for compatibility with the codec path.

use std::f64::consts::PI;

/// Butterworth Q, maximally flat magnitude response.
pub const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Peaking-EQ gains below this magnitude collapse to the identity biquad.
pub const BYPASS_GAIN_DB: f64 = 0.1;

/// One normalized coefficient set (a0 = 1).
///
/// Values are assigned whole by the constructors below and never mutated by
/// `Biquad::process`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Default for Coeffs {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Coeffs {
    /// Unity passthrough.
    pub const IDENTITY: Coeffs = Coeffs {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// Bypass hint: callers can skip the filter entirely when this is set.
    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Second-order high-pass, Butterworth Q.
    pub fn high_pass(frequency: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * frequency / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * BUTTERWORTH_Q);

        let a0 = 1.0 + alpha;
        Coeffs {
            b0: ((1.0 + cos_w0) / 2.0) / a0,
            b1: (-(1.0 + cos_w0)) / a0,
            b2: ((1.0 + cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Second-order low-pass, Butterworth Q.
    pub fn low_pass(frequency: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * frequency / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * BUTTERWORTH_Q);

        let a0 = 1.0 + alpha;
        Coeffs {
            b0: ((1.0 - cos_w0) / 2.0) / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: ((1.0 - cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Peaking EQ with per-band Q. Gains within [`BYPASS_GAIN_DB`] of flat
    /// return [`Coeffs::IDENTITY`] so the band can be skipped without a glitch.
    pub fn peaking(frequency: f64, gain_db: f64, q: f64, sample_rate: f64) -> Self {
        if gain_db.abs() < BYPASS_GAIN_DB {
            return Self::IDENTITY;
        }

        let a = 10.0_f64.powf(gain_db / 40.0); // sqrt of linear gain
        let w0 = 2.0 * PI * frequency / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha / a;
        Coeffs {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_w0) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }

    /// Notch: full rejection at the center frequency, unity elsewhere.
    pub fn notch(frequency: f64, q: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * frequency / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        Coeffs {
            b0: 1.0 / a0,
            b1: (-2.0 * cos_w0) / a0,
            b2: 1.0 / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// High shelf boosting (or cutting) above the corner frequency.
    pub fn high_shelf(frequency: f64, gain_db: f64, sample_rate: f64) -> Self {
        if gain_db.abs() < BYPASS_GAIN_DB {
            return Self::IDENTITY;
        }

        let a = 10.0_f64.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * frequency / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * BUTTERWORTH_Q);
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let a0 = (a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha;
        Coeffs {
            b0: (a * ((a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha)) / a0,
            b1: (-2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0)) / a0,
            b2: (a * ((a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha)) / a0,
            a1: (2.0 * ((a - 1.0) - (a + 1.0) * cos_w0)) / a0,
            a2: ((a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha) / a0,
        }
    }
}

/// Biquad filter section with per-instance state.
#[derive(Clone, Debug, Default)]
pub struct Biquad {
    coeffs: Coeffs,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn new(coeffs: Coeffs) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Replace the coefficient set. Filter state is preserved so a running
    /// signal settles within one block instead of clicking.
    pub fn set_coeffs(&mut self, coeffs: Coeffs) {
        self.coeffs = coeffs;
    }

    pub fn coeffs(&self) -> &Coeffs {
        &self.coeffs
    }

    /// Process a single sample (Direct Form II Transposed).
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let x = input as f64;
        let c = &self.coeffs;
        let output = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * output + self.z2;
        self.z2 = c.b2 * x - c.a2 * output;
        output as f32
    }

    /// Process a block in place. Identity coefficient sets are skipped.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        if self.coeffs.is_identity() {
            return;
        }
        for sample in buffer.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Zero the delay line.
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}
