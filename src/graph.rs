//! In-memory computation graph as delivered by the model loader.
//!
//! The loader is a separate tool: it parses the interchange format, runs
//! shape inference, and hands the result over as JSON in the shape
//! deserialized here. All tensor shapes, including those of intermediate
//! activations, are expected to be known by the time the graph reaches the
//! compiler.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Output names of tile-producing operators carry this suffix after merge
/// splitting; shape lookups resolve them to the pre-split name.
pub const MERGE_SUFFIX: &str = "_before_merge";

/// Element types the compiler accepts. Anything else is rejected by the
/// serializer as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ElemType {
    Float32,
    Int64,
}

/// A named constant tensor (weight, bias, or shape operand).
#[derive(Debug, Clone, Deserialize)]
pub struct Initializer {
    pub name: String,
    pub elem_type: ElemType,
    pub dims: Vec<usize>,
    #[serde(default)]
    pub float_data: Vec<f32>,
    #[serde(default)]
    pub int64_data: Vec<i64>,
}

impl Initializer {
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn data_len(&self) -> usize {
        match self.elem_type {
            ElemType::Float32 => self.float_data.len(),
            ElemType::Int64 => self.int64_data.len(),
        }
    }
}

/// Attribute value attached to a graph node.
#[derive(Debug, Clone, Deserialize)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

/// One operator in the graph.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphNode {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Attribute>,
}

impl GraphNode {
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(Attribute::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attributes.get(name) {
            Some(Attribute::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name) {
            Some(Attribute::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Display name: falls back to the operator kind for anonymous nodes.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.op_type
        } else {
            &self.name
        }
    }
}

/// Name and dims of a graph input, output, or intermediate value.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueShape {
    pub name: String,
    pub dims: Vec<usize>,
}

/// The complete graph handed over by the loader.
#[derive(Debug, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub name: String,
    pub inputs: Vec<ValueShape>,
    pub outputs: Vec<ValueShape>,
    pub nodes: Vec<GraphNode>,
    pub initializers: Vec<Initializer>,
    #[serde(default)]
    pub value_shapes: Vec<ValueShape>,
}

impl Graph {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read graph file {}", path.as_ref().display()))?;
        serde_json::from_str(&data).context("Failed to parse graph JSON")
    }

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|i| i.name == name)
    }

    pub fn initializer_mut(&mut self, name: &str) -> Option<&mut Initializer> {
        self.initializers.iter_mut().find(|i| i.name == name)
    }

    /// Dims of a named value, searching intermediates, inputs, and outputs.
    /// Tile-split output names resolve to their pre-split entry.
    pub fn value_dims(&self, name: &str) -> Option<&[usize]> {
        let name = name.strip_suffix(MERGE_SUFFIX).unwrap_or(name);
        self.value_shapes
            .iter()
            .chain(self.inputs.iter())
            .chain(self.outputs.iter())
            .find(|v| v.name == name)
            .map(|v| v.dims.as_slice())
    }

    pub fn print_summary(&self) {
        println!("Graph: {}", self.name);
        println!("\nInputs:");
        for input in &self.inputs {
            println!("  {} {:?}", input.name, input.dims);
        }
        println!("\nOutputs:");
        for output in &self.outputs {
            println!("  {} {:?}", output.name, output.dims);
        }
        println!("\nNodes: {}", self.nodes.len());

        let mut op_counts: HashMap<&str, usize> = HashMap::new();
        for node in &self.nodes {
            *op_counts.entry(&node.op_type).or_insert(0) += 1;
        }
        let mut ops: Vec<_> = op_counts.into_iter().collect();
        ops.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        for (op, count) in ops {
            println!("  {}: {}", op, count);
        }

        println!("\nInitializers: {}", self.initializers.len());
        let total_elems: usize = self.initializers.iter().map(|t| t.data_len()).sum();
        println!("  Total parameter elements: {}", total_elems);
    }
}

/// Test samples and labels, prepared by the external dataset tooling.
#[derive(Debug, Deserialize)]
pub struct SampleSet {
    /// Dims of one sample tensor, e.g. `[1, 28, 28]`.
    pub dims: Vec<usize>,
    /// Flattened row-major float data, one entry per sample.
    pub images: Vec<Vec<f32>>,
    /// One class label per sample.
    pub labels: Vec<u8>,
}

impl SampleSet {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read samples file {}", path.as_ref().display()))?;
        let set: SampleSet = serde_json::from_str(&data).context("Failed to parse samples JSON")?;
        let expected: usize = set.dims.iter().product();
        for (idx, im) in set.images.iter().enumerate() {
            anyhow::ensure!(
                im.len() == expected,
                "Sample {} has {} elements, dims {:?} require {}",
                idx,
                im.len(),
                set.dims,
                expected
            );
        }
        anyhow::ensure!(
            set.labels.len() == set.images.len(),
            "Sample set has {} images but {} labels",
            set.images.len(),
            set.labels.len()
        );
        Ok(set)
    }

    pub fn sample_elements(&self) -> usize {
        self.dims.iter().product()
    }
}
