//! Graph normalization.
//!
//! Rewrites the loader's DAG into the flat, integer-indexed node list the
//! image serializer consumes: folds shape-only operators fed by constants,
//! splits tile-producing operators into compute + merge pairs, assigns every
//! tensor a flat index, derives per-node flags from attributes, and computes
//! output live ranges.
//!
//! Indexing policy: `0..n_input` are graph inputs and constants, `n_input..`
//! are node outputs (index = topological position + `n_input`).

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{ensure, Context, Result};

use crate::flags::{self, NodeFlags, OpFlags};
use crate::graph::{ElemType, Graph, GraphNode, MERGE_SUFFIX};

/// Operators whose output is produced across multiple tiles and therefore
/// needs a synthetic merge pass.
pub const OPS_WITH_MERGE: &[&str] = &["Conv", "Gemm"];

/// Operators the runtime has handlers for. Anything else is dropped from
/// the graph with a warning.
pub const SUPPORTED_OPS: &[&str] = &[
    "Add",
    "Concat",
    "Conv",
    "ConvMerge",
    "Dropout",
    "Gemm",
    "GemmMerge",
    "GlobalAveragePool",
    "MatMul",
    "MaxPool",
    "Relu",
    "Reshape",
    "Softmax",
    "Squeeze",
    "Transpose",
];

/// Operators whose handler writes its output into the input's slot.
pub const INPLACE_UPDATE_OPS: &[&str] = &["Reshape", "Softmax", "Squeeze", "Transpose"];

/// Normalized node, still referencing tensors by name. The tiling planner
/// fills in the flags before the graph is frozen into records.
#[derive(Debug, Clone)]
pub struct WorkNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub flags: NodeFlags,
}

/// Frozen node record with resolved input indices.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub output_name: String,
    pub inputs: Vec<usize>,
    pub op_type: String,
    pub flags: NodeFlags,
    /// Topological position of the last consumer of this node's output.
    pub max_output_id: u16,
}

/// Result of normalization: the work list plus the tensor index table.
#[derive(Debug)]
pub struct Normalized {
    pub nodes: Vec<WorkNode>,
    pub names: HashMap<String, usize>,
    pub n_input: usize,
    /// Names of convolution filter initializers, reordered at write time.
    pub conv_param_names: HashSet<String>,
    /// Sorted operator table the node records index into.
    pub ops: Vec<String>,
}

pub fn normalize(graph: &mut Graph) -> Result<Normalized> {
    let ops = collect_ops(graph);
    let replaced = fold_shape_constants(graph)?;
    fold_transposed_gemm(graph);

    let mut nodes: Vec<WorkNode> = Vec::new();
    let mut conv_param_names = HashSet::new();
    for node in &graph.nodes {
        if !SUPPORTED_OPS.contains(&node.op_type.as_str()) {
            eprintln!(
                "Warning: skipping unsupported operator {} ({})",
                node.op_type,
                node.display_name()
            );
            continue;
        }
        ensure!(
            !node.outputs.is_empty(),
            "Node {} has no outputs",
            node.display_name()
        );
        if replaced.contains_key(&node.outputs[0]) {
            continue;
        }
        let inputs: Vec<String> = node
            .inputs
            .iter()
            .map(|name| resolve(&replaced, name).to_string())
            .collect();
        if node.op_type == "Conv" {
            if let Some(filter) = inputs.get(1) {
                conv_param_names.insert(filter.clone());
            }
        }
        let mut outputs = node.outputs.clone();
        let split = OPS_WITH_MERGE.contains(&node.op_type.as_str());
        let merged_output = outputs[0].clone();
        if split {
            outputs = vec![format!("{}{}", merged_output, MERGE_SUFFIX)];
        }
        nodes.push(WorkNode {
            name: node.display_name().to_string(),
            op_type: node.op_type.clone(),
            inputs,
            outputs: outputs.clone(),
            flags: derive_flags(node),
        });
        if split {
            nodes.push(WorkNode {
                name: format!("{}:merge", node.display_name()),
                op_type: format!("{}Merge", node.op_type),
                inputs: outputs,
                outputs: vec![merged_output],
                flags: NodeFlags::default(),
            });
        }
        mark_layout_conversion(&mut nodes);
    }

    let mut names = HashMap::new();
    for (idx, input) in graph.inputs.iter().enumerate() {
        names.insert(input.name.clone(), idx);
    }
    for init in &graph.initializers {
        if !names.contains_key(&init.name) {
            let idx = names.len();
            names.insert(init.name.clone(), idx);
        }
    }
    let n_input = names.len();

    for (idx, node) in nodes.iter().enumerate() {
        let outputs = if node.op_type == "Dropout" {
            // The second output (`mask`) is never materialized.
            &node.outputs[..1]
        } else {
            &node.outputs[..]
        };
        for output in outputs {
            names.insert(output.clone(), idx + n_input);
        }
    }

    Ok(Normalized {
        nodes,
        names,
        n_input,
        conv_param_names,
        ops,
    })
}

/// Resolve input indices and compute live ranges. An input name with no
/// assigned index means the interchange graph was invalid; that is fatal.
pub fn freeze(norm: &Normalized) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(norm.nodes.len());
    for work in &norm.nodes {
        let inputs = work
            .inputs
            .iter()
            .map(|name| {
                norm.names.get(name).copied().with_context(|| {
                    format!("Unresolvable tensor reference {:?} in node {}", name, work.name)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        nodes.push(Node {
            name: work.name.clone(),
            output_name: work.outputs[0].clone(),
            inputs,
            op_type: work.op_type.clone(),
            flags: work.flags,
            max_output_id: 0,
        });
    }
    compute_liveness(&mut nodes, norm.n_input);
    Ok(nodes)
}

pub fn max_input_count(nodes: &[Node]) -> usize {
    nodes.iter().map(|n| n.inputs.len()).max().unwrap_or(0)
}

/// Fold squeeze/reshape operators whose data input is a constant by
/// rewriting the constant's dims and redirecting consumers. The input is
/// resolved through the substitution map first, so chains of fold-eligible
/// operators collapse in a single pass.
fn fold_shape_constants(graph: &mut Graph) -> Result<HashMap<String, String>> {
    let mut replaced: HashMap<String, String> = HashMap::new();
    for idx in 0..graph.nodes.len() {
        let node = graph.nodes[idx].clone();
        if node.op_type != "Squeeze" && node.op_type != "Reshape" {
            continue;
        }
        let (Some(first_input), Some(_)) = (node.inputs.first(), node.outputs.first()) else {
            continue;
        };
        let data_input = resolve(&replaced, first_input).to_string();
        if graph.initializer(&data_input).is_none() {
            continue;
        }
        match node.op_type.as_str() {
            "Squeeze" => {
                // Since opset 13, axes is an input instead of an attribute.
                let axes: Vec<i64> = match node.inputs.get(1) {
                    Some(axes_name) => graph
                        .initializer(axes_name)
                        .with_context(|| format!("Squeeze axes input {:?} is not constant", axes_name))?
                        .int64_data
                        .clone(),
                    None => node.get_ints("axes").map(|v| v.to_vec()).unwrap_or_default(),
                };
                let Some(inp) = graph.initializer_mut(&data_input) else {
                    continue;
                };
                let new_dims: Vec<usize> = inp
                    .dims
                    .iter()
                    .enumerate()
                    .filter(|(dim_idx, _)| !axes.contains(&(*dim_idx as i64)))
                    .map(|(_, &dim)| dim)
                    .collect();
                inp.dims = new_dims;
            }
            "Reshape" => {
                let dims_name = node
                    .inputs
                    .get(1)
                    .with_context(|| format!("Reshape {} has no shape input", node.display_name()))?;
                let new_dims = graph
                    .initializer(dims_name)
                    .with_context(|| format!("Reshape shape input {:?} is not constant", dims_name))?
                    .int64_data
                    .clone();
                anyhow::ensure!(
                    !new_dims.is_empty(),
                    "Reshape {} has an empty shape constant",
                    node.display_name()
                );
                let Some(inp) = graph.initializer_mut(&data_input) else {
                    continue;
                };
                inp.dims = new_dims.iter().map(|&d| d as usize).collect();
            }
            _ => unreachable!(),
        }
        replaced.insert(node.outputs[0].clone(), data_input);
    }
    Ok(replaced)
}

/// Transpose a constant Gemm B operand in place when `transB` is set, so
/// the runtime only ever sees untransposed weights.
fn fold_transposed_gemm(graph: &mut Graph) {
    for idx in 0..graph.nodes.len() {
        let node = &graph.nodes[idx];
        if node.op_type != "Gemm" || node.get_int("transB") != Some(1) {
            continue;
        }
        let Some(b_name) = node.inputs.get(1).cloned() else {
            continue;
        };
        let Some(b) = graph.initializer(&b_name) else {
            continue;
        };
        if b.elem_type != ElemType::Float32 || b.dims.len() != 2 {
            continue;
        }
        let (rows, cols) = (b.dims[0], b.dims[1]);
        let Some(b) = graph.initializer_mut(&b_name) else {
            continue;
        };
        let mut transposed = vec![0.0f32; b.float_data.len()];
        for r in 0..rows {
            for c in 0..cols {
                transposed[c * rows + r] = b.float_data[r * cols + c];
            }
        }
        b.float_data = transposed;
        b.dims = vec![cols, rows];
        graph.nodes[idx].attributes.remove("transB");
    }
}

fn derive_flags(node: &GraphNode) -> NodeFlags {
    let mut out = NodeFlags::default();
    match node.op_type.as_str() {
        "Conv" => {
            let auto_pad = node.get_str("auto_pad");
            let pads = node.get_ints("pads");
            if auto_pad == Some("VALID") || (auto_pad.is_none() && pads.is_none()) {
                out.generic |= flags::AUTO_PAD_VALID;
            }
            if let Some(strides) = node.get_ints("strides") {
                out.stride = strides[0] as u8;
            }
        }
        "MaxPool" => {
            if let Some(kernel_shape) = node.get_ints("kernel_shape") {
                out.kernel_size = kernel_shape[0] as u8;
            }
            if let Some(strides) = node.get_ints("strides") {
                out.stride = strides[0] as u8;
            }
        }
        "Squeeze" => {
            let mut axes = 0u8;
            for &axis in node.get_ints("axes").unwrap_or(&[]) {
                axes |= 1 << axis;
            }
            out.extra = OpFlags::Squeeze { axes };
        }
        _ => {}
    }
    out
}

/// A pooling output consumed directly by a reshape is reinterpreted
/// channel-first by the runtime; mark the pooling node for conversion.
fn mark_layout_conversion(nodes: &mut [WorkNode]) {
    let len = nodes.len();
    if len < 2 {
        return;
    }
    if nodes[len - 1].op_type == "Reshape" && nodes[len - 2].op_type == "MaxPool" {
        nodes[len - 2].flags.generic |= flags::NHWC2NCHW;
    }
}

fn compute_liveness(nodes: &mut [Node], n_input: usize) {
    for idx in 0..nodes.len() {
        for j in 0..nodes[idx].inputs.len() {
            let inp = nodes[idx].inputs[j];
            if inp < n_input {
                continue;
            }
            let used = inp - n_input;
            nodes[used].max_output_id = nodes[used].max_output_id.max(idx as u16);
        }
    }
    // Inputs of Concat must be kept until the Concat itself executes.
    for idx in 0..nodes.len() {
        if nodes[idx].op_type != "Concat" {
            continue;
        }
        let concat_max = nodes[idx].max_output_id;
        for j in 0..nodes[idx].inputs.len() {
            let inp = nodes[idx].inputs[j];
            if inp < n_input {
                continue;
            }
            let used = inp - n_input;
            nodes[used].max_output_id = nodes[used].max_output_id.max(concat_max);
        }
    }
}

/// Operator table for the emitted image: every supported kind present in
/// the incoming graph, plus the merge variants, sorted by name.
fn collect_ops(graph: &Graph) -> Vec<String> {
    let mut ops: BTreeSet<String> = graph
        .nodes
        .iter()
        .filter(|n| SUPPORTED_OPS.contains(&n.op_type.as_str()))
        .map(|n| n.op_type.clone())
        .collect();
    for op in OPS_WITH_MERGE {
        if ops.contains(*op) {
            ops.insert(format!("{}Merge", op));
        }
    }
    ops.into_iter().collect()
}

fn resolve<'a>(map: &'a HashMap<String, String>, name: &'a str) -> &'a str {
    let mut cur = name;
    while let Some(next) = map.get(cur) {
        cur = next;
    }
    cur
}
