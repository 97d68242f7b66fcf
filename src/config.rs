//! Deployment configuration, resolved once at startup and threaded through
//! every stage as an immutable value.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

/// External FRAM capacity in bytes.
pub const NVM_SIZE: usize = 512 * 1024;
pub const NODE_NAME_LEN: usize = 60;
/// Trailing bytes in a parameter record, kept for memory alignment.
pub const EXTRA_INFO_LEN: usize = 3;
pub const TURNING_POINTS_LEN: usize = 8;
/// Used by the convolution scratch layout.
pub const TEMP_FILTER_WIDTH: usize = 1;
/// Length of the processing-state buffer on ARM targets.
pub const ARM_PSTATE_LEN: usize = 8704;
pub const DEFAULT_N_SAMPLES: usize = 20;
pub const DEFAULT_TILE_C: usize = 4;
pub const DEFAULT_TILE_H: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    Msp430,
    Msp432,
}

impl Target {
    /// Usable elements in the on-chip scratch buffer.
    pub fn scratch_buffer_size(self) -> usize {
        match self {
            // (4096 - LEASTACK - 2 * MAC params) / sizeof(int16_t)
            Target::Msp430 => 1884,
            Target::Msp432 => 18000,
        }
    }

    pub fn use_arm_cmsis(self) -> bool {
        matches!(self, Target::Msp432)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Target::Msp430 => "msp430",
            Target::Msp432 => "msp432",
        }
    }
}

/// Crash-recovery discipline the produced image is laid out for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMethod {
    Baseline,
    Hawaii,
    Japari,
    Stateful,
}

impl RecoveryMethod {
    pub fn is_intermittent(self) -> bool {
        !matches!(self, RecoveryMethod::Baseline)
    }

    /// Disciplines that track per-slot turning points in the model header.
    pub fn indirect_recovery(self) -> bool {
        matches!(self, RecoveryMethod::Stateful | RecoveryMethod::Japari)
    }

    /// Disciplines that append footprint counters to each node record.
    pub fn node_footprints(self) -> bool {
        matches!(self, RecoveryMethod::Hawaii)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryMethod::Baseline => "Baseline",
            RecoveryMethod::Hawaii => "HAWAII",
            RecoveryMethod::Japari => "JAPARI",
            RecoveryMethod::Stateful => "STATEFUL",
        }
    }
}

/// Per-model deployment parameters, read from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Config name, echoed into the generated declarations.
    pub name: String,
    /// Divisor applied to parameters before Q15 conversion.
    pub scale: u16,
    /// Divisor applied to input samples before Q15 conversion.
    pub input_scale: u16,
    pub num_slots: u8,
    /// Per-slot budget for intermediate values, in bytes.
    pub intermediate_values_size: usize,
    /// Minimum tile granularity of the target's vector ops.
    pub op_filters: usize,
    /// Dims of one input sample, e.g. `[1, 28, 28]`.
    pub sample_size: Vec<usize>,
    pub n_all_samples: usize,
    #[serde(default)]
    pub first_sample_outputs: Vec<f64>,
    #[serde(default)]
    pub fp32_accuracy: f64,
}

impl ModelConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        serde_json::from_str(&data).context("Failed to parse config JSON")
    }

    /// Bytes of one quantized sample (Q15 is 16-bit).
    pub fn sample_bytes(&self) -> usize {
        2 * self.sample_size.iter().product::<usize>()
    }
}

/// Everything the pipeline needs to know about the target device and the
/// chosen deployment, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub target: Target,
    pub method: RecoveryMethod,
    pub batch_size: usize,
    pub scratch_buffer_size: usize,
    pub nvm_size: usize,
    pub n_samples: usize,
    pub merge_bias: bool,
    pub model: ModelConfig,
}

impl DeviceConfig {
    pub fn new(
        target: Target,
        method: RecoveryMethod,
        batch_size: usize,
        all_samples: bool,
        merge_bias: bool,
        mut model: ModelConfig,
    ) -> Self {
        if method == RecoveryMethod::Japari {
            // Footprint elements double the intermediate storage need.
            model.intermediate_values_size *= 2;
        }
        let mut nvm_size = NVM_SIZE;
        let n_samples = if all_samples {
            nvm_size += model.n_all_samples * model.sample_bytes();
            model.n_all_samples
        } else {
            DEFAULT_N_SAMPLES
        };
        DeviceConfig {
            target,
            method,
            batch_size,
            scratch_buffer_size: target.scratch_buffer_size(),
            nvm_size,
            n_samples,
            merge_bias,
            model,
        }
    }
}
