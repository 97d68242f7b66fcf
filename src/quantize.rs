//! Fixed-point conversion to the target's Q15 format.
//!
//! Q15 represents `[-1, 32767/32768]` at 2^-15 resolution. Values are
//! scaled by a per-tensor-class divisor first, clamped, and truncated onto
//! the representable grid. Out-of-range values are diagnosable, never
//! fatal: the pipeline always completes with clamped data.

pub const Q15_ONE: f64 = 32768.0;
pub const Q15_LOWER: f64 = -1.0;
pub const Q15_UPPER: f64 = 32767.0 / 32768.0;

/// One recorded range overflow: the scaled value fell outside the unit
/// interval before clamping.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeOverflow {
    pub tensor: String,
    pub value: f64,
}

/// Collects diagnosable events across the run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    overflows: Vec<RangeOverflow>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_overflow(&mut self, tensor: &str, value: f64) {
        eprintln!(
            "Warning: {} value {} goes beyond the range of Q15 [{}, {})",
            tensor, value, Q15_LOWER, Q15_UPPER
        );
        self.overflows.push(RangeOverflow {
            tensor: tensor.to_string(),
            value,
        });
    }

    pub fn overflows(&self) -> &[RangeOverflow] {
        &self.overflows
    }
}

/// Convert one already-scaled value to Q15. Exactly ±1.0 converts to the
/// clamped boundary code silently; only values strictly beyond the unit
/// interval are reported.
pub fn to_q15(value: f64, tensor: &str, diag: &mut Diagnostics) -> i16 {
    if value < Q15_LOWER || value > 1.0 {
        diag.report_overflow(tensor, value);
    }
    let clamped = value.clamp(Q15_LOWER, Q15_UPPER);
    (clamped * Q15_ONE).trunc() as i16
}

/// Scale a float slice by `divisor` and convert each element.
pub fn quantize(values: &[f32], divisor: f64, tensor: &str, diag: &mut Diagnostics) -> Vec<i16> {
    values
        .iter()
        .map(|&v| to_q15(v as f64 / divisor, tensor, diag))
        .collect()
}

/// Inverse conversion, for verification only; the compiler never reads
/// quantized data back.
pub fn from_q15(code: i16) -> f64 {
    code as f64 / Q15_ONE
}
