//! Tiling planner.
//!
//! For buffer-bound operators, finds the largest tile sizes whose working
//! set fits the on-chip scratch buffer and whose per-tile intermediate
//! storage fits the configured NVM budget. The searches only ever shrink a
//! bounded positive candidate (or widen one dimension to unlock a smaller
//! other dimension), so they terminate or fail explicitly.

use anyhow::{ensure, Context, Result};

use crate::config::{DeviceConfig, ARM_PSTATE_LEN, TEMP_FILTER_WIDTH};
use crate::flags::OpFlags;
use crate::graph::Graph;
use crate::normalize::{Normalized, WorkNode};

pub fn plan(norm: &mut Normalized, graph: &Graph, cfg: &DeviceConfig) -> Result<()> {
    for idx in 0..norm.nodes.len() {
        let extra = match norm.nodes[idx].op_type.as_str() {
            "Conv" => Some(conv_tile(&norm.nodes, idx, graph, cfg)?),
            "Gemm" => Some(gemm_tile(&norm.nodes[idx], graph, cfg)?),
            _ => None,
        };
        if let Some(extra) = extra {
            norm.nodes[idx].flags.extra = extra;
        }
    }
    Ok(())
}

fn conv_tile(
    nodes: &[WorkNode],
    idx: usize,
    graph: &Graph,
    cfg: &DeviceConfig,
) -> Result<OpFlags> {
    let node = &nodes[idx];
    let out_dims = graph
        .value_dims(&node.outputs[0])
        .with_context(|| format!("No shape known for convolution output {:?}", node.outputs[0]))?;
    ensure!(
        out_dims.len() == 4,
        "Convolution {} output is not 4-dimensional: {:?}",
        node.name,
        out_dims
    );
    let (output_channel, output_h, output_w) = (out_dims[1], out_dims[2], out_dims[3]);
    let filter = graph
        .initializer(&node.inputs[1])
        .with_context(|| format!("Convolution {} has no constant filter", node.name))?;
    ensure!(
        filter.dims.len() == 4,
        "Convolution {} filter is not 4-dimensional: {:?}",
        node.name,
        filter.dims
    );
    let channel = filter.dims[1];
    let k_h = filter.dims[2];
    let k_w = filter.dims[3];

    // Tiles fed by a channel-concatenating node live in separate slots;
    // halve the contiguous run so two branches are never merged into one
    // tile.
    let separate_tiling = graph.initializer(&node.inputs[0]).is_none()
        && producer_op(nodes, &node.inputs[0]) == Some("Concat");

    let mut max_continuous_channels = channel;
    if separate_tiling {
        max_continuous_channels /= 2;
    }
    let mut input_tile_c = if max_continuous_channels % 2 == 1 {
        max_continuous_channels
    } else {
        let mut tile = 1;
        while max_continuous_channels % (tile * 2) == 0 && tile < 128 {
            tile *= 2;
        }
        tile
    };

    let memory_usage = |output_tile_c: usize, filter_len: usize| {
        ((output_tile_c * 2 + 1) + TEMP_FILTER_WIDTH) * filter_len
    };

    let output_tile_c = loop {
        let mut input_tile_too_large = false;
        // One extra element per row for the bias, rounded up to a Q15 pair.
        let filter_len = (input_tile_c * k_w + 1 + 1) / 2 * 2 * 2 * k_h;
        let mut output_tile_c = output_channel;
        while memory_usage(output_tile_c, filter_len) > cfg.scratch_buffer_size {
            output_tile_c /= 2;
            if output_tile_c % 2 == 1 || output_tile_c < cfg.model.op_filters {
                // No even output tile fits with this input tile.
                input_tile_too_large = true;
                break;
            }
        }
        if !input_tile_too_large {
            let params_len =
                channel.div_ceil(input_tile_c) * output_channel * output_h * output_w * 2;
            if params_len < cfg.model.intermediate_values_size {
                break output_tile_c;
            }
        }
        input_tile_c /= 2;
        ensure!(
            input_tile_c > 0,
            "Convolution {}: output does not fit the device at any tile size",
            node.name
        );
    };

    Ok(OpFlags::Conv {
        input_tile_c: input_tile_c as u8,
        output_tile_c: output_tile_c as u8,
    })
}

fn gemm_tile(node: &WorkNode, graph: &Graph, cfg: &DeviceConfig) -> Result<OpFlags> {
    let a_dims = graph
        .value_dims(&node.inputs[0])
        .with_context(|| format!("No shape known for activation input {:?}", node.inputs[0]))?;
    // The batch dimension is symbolic at this point; one row per pass.
    let a_rows = 1usize;
    let a_cols = a_dims[1];
    let b = graph
        .initializer(&node.inputs[1])
        .with_context(|| format!("Fully-connected {} has no constant weights", node.name))?;
    let b_rows = b.dims[0];

    // Writing a batch at a time is simpler and faster.
    let unit = cfg.model.op_filters;
    let mut tile_width = unit;
    let mut tile_channel;
    loop {
        let channel_ceiling = (ARM_PSTATE_LEN / tile_width) / 2 * 2;
        ensure!(
            channel_ceiling > 2,
            "Fully-connected {}: processing state cannot hold tile width {}",
            node.name,
            tile_width
        );
        tile_channel = (channel_ceiling - 2).min(b_rows) / unit * unit;
        // Scratch addresses must stay 4-byte aligned, i.e. whole Q15 pairs.
        let full_tile_width = (extend_for_footprints(cfg.batch_size, tile_width) + 1) / 2 * 2;
        while tile_channel > 0 {
            let needed_mem = (a_rows * a_cols + 2)
                + (tile_channel + 2) * full_tile_width
                + a_rows * full_tile_width;
            if needed_mem <= cfg.scratch_buffer_size {
                break;
            }
            tile_channel -= unit;
        }
        if tile_channel > 0 {
            break;
        }
        tile_width += unit;
    }

    while tile_width * (tile_channel + 2) > ARM_PSTATE_LEN {
        ensure!(
            tile_width > unit,
            "Fully-connected {}: processing state cannot hold any tile",
            node.name
        );
        tile_width -= unit;
    }

    Ok(OpFlags::Gemm {
        tile_channel: tile_channel as u16,
        tile_width: tile_width as u16,
    })
}

/// A tile row reserves one footprint element per batch.
fn extend_for_footprints(batch_size: usize, n: usize) -> usize {
    n + n / batch_size
}

fn producer_op<'a>(nodes: &'a [WorkNode], name: &str) -> Option<&'a str> {
    nodes
        .iter()
        .find(|n| n.outputs.iter().any(|o| o == name))
        .map(|n| n.op_type.as_str())
}
