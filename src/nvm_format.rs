//! NVM image layout and serialization.
//!
//! Storage is divided into slots: read-only parameter storage, test-sample
//! storage, and per-slot intermediate-value regions the runtime reuses
//! across operators. Section records are fixed-width and self-contained so
//! the runtime can re-read the image from the beginning after an arbitrary
//! power failure. Offsets within a slot are assigned monotonically and
//! never reused within one compilation run.

use std::io::{self, Write};

use anyhow::{ensure, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::{DeviceConfig, EXTRA_INFO_LEN, NODE_NAME_LEN, TURNING_POINTS_LEN};
use crate::graph::{ElemType, Graph, Initializer, SampleSet};
use crate::normalize::{max_input_count, Node, Normalized};
use crate::quantize::{quantize, to_q15, Diagnostics};

pub const SLOT_PARAMETERS: u8 = 0xf0;
pub const SLOT_TEST_SET: u8 = 0xff;
pub const SLOT_CONSTANTS_MIN: u8 = SLOT_PARAMETERS;
pub const SLOT_INTERMEDIATE_VALUES: u8 = 0b01;

/// Parameter-record flag: per-channel bias values are interleaved into the
/// filter payload.
pub const PARAM_FLAG_MERGED_BIAS: u8 = 1 << 0;

/// Fixed width of one parameter record in bytes.
pub const PARAMETER_RECORD_SIZE: usize = 4 + 4 + 1 + 1 + 2 + 8 + 2 + 1 + EXTRA_INFO_LEN + 2;

/// One per-tensor metadata record. Every tensor in the network gets exactly
/// one, in one contiguous table: inputs, then constants, then placeholders
/// for intermediate activations.
#[derive(Debug, Clone, Default)]
pub struct ParameterRecord {
    pub offset: u32,
    pub len: u32,
    pub bitwidth: u8,
    pub slot: u8,
    pub dims: [u16; 4],
    pub scale: u16,
    pub flags: u8,
    pub extra_info: [u8; EXTRA_INFO_LEN],
    pub index: u16,
}

impl ParameterRecord {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.offset)?;
        w.write_u32::<LittleEndian>(self.len)?;
        w.write_u8(self.bitwidth)?;
        w.write_u8(self.slot)?;
        w.write_u16::<LittleEndian>(0)?; // dummy, for alignment
        for dim in &self.dims {
            w.write_u16::<LittleEndian>(*dim)?;
        }
        w.write_u16::<LittleEndian>(self.scale)?;
        w.write_u8(self.flags)?;
        w.write_all(&self.extra_info)?;
        w.write_u16::<LittleEndian>(self.index)?;
        Ok(())
    }
}

/// Fixed-length ASCII name field, NUL-padded.
fn write_name<W: Write>(w: &mut W, name: &str) -> Result<()> {
    ensure!(
        name.len() <= NODE_NAME_LEN,
        "Name too long for a node record: {:?}",
        name
    );
    ensure!(name.is_ascii(), "Name is not ASCII: {:?}", name);
    w.write_all(name.as_bytes())?;
    w.write_all(&ZEROS[..NODE_NAME_LEN - name.len()])?;
    Ok(())
}

const ZEROS: [u8; NODE_NAME_LEN] = [0; NODE_NAME_LEN];

/// One fixed-size node record. `num_inputs` is the graph-wide maximum
/// arity; shorter input lists are zero-padded to it.
pub fn write_node<W: Write>(
    w: &mut W,
    node: &Node,
    num_inputs: usize,
    op_code: u16,
    footprints: bool,
) -> Result<()> {
    write_name(w, &node.name)?;
    write_name(w, &node.output_name)?;
    w.write_u16::<LittleEndian>(node.inputs.len() as u16)?;
    for &inp in &node.inputs {
        w.write_u16::<LittleEndian>(inp as u16)?;
    }
    for _ in node.inputs.len()..num_inputs {
        w.write_u16::<LittleEndian>(0)?;
    }
    w.write_u16::<LittleEndian>(node.max_output_id)?;
    w.write_u16::<LittleEndian>(op_code)?;
    w.write_u64::<LittleEndian>(node.flags.pack())?;
    if footprints {
        // Footprint counters, maintained by the runtime.
        w.write_u32::<LittleEndian>(0)?;
        w.write_u32::<LittleEndian>(0)?;
    }
    Ok(())
}

pub fn node_record_size(num_inputs: usize, footprints: bool) -> usize {
    2 * NODE_NAME_LEN + 2 + 2 * num_inputs + 2 + 2 + 8 + if footprints { 8 } else { 0 }
}

/// The mutable control block the runtime updates on every inference step;
/// the compiler writes its initial sentinel state.
pub fn write_model_header<W: Write>(w: &mut W, cfg: &DeviceConfig) -> Result<()> {
    w.write_u16::<LittleEndian>(0)?; // running
    w.write_u16::<LittleEndian>(0)?; // run counter
    w.write_u16::<LittleEndian>(0)?; // current layer index
    for _ in 0..cfg.model.num_slots {
        if cfg.method.indirect_recovery() {
            w.write_u8(1)?; // state bit
            w.write_u8(0)?; // number of turning points
            for _ in 0..TURNING_POINTS_LEN {
                w.write_i16::<LittleEndian>(-1)?;
            }
        }
        w.write_i16::<LittleEndian>(-1)?; // owning layer
    }
    w.write_u8(0)?; // dummy
    w.write_u8(0)?; // version
    Ok(())
}

pub fn model_header_size(cfg: &DeviceConfig) -> usize {
    let per_slot = if cfg.method.indirect_recovery() {
        1 + 1 + 2 * TURNING_POINTS_LEN + 2
    } else {
        2
    };
    3 * 2 + cfg.model.num_slots as usize * per_slot + 2
}

/// All sections of the produced image, kept separate so the generated
/// declarations can reference each one.
#[derive(Debug, Default)]
pub struct NvmImage {
    pub parameters: Vec<u8>,
    pub samples: Vec<u8>,
    pub model: Vec<u8>,
    pub nodes: Vec<u8>,
    pub model_parameters_info: Vec<u8>,
    pub intermediate_parameters_info: Vec<u8>,
    pub labels: Vec<u8>,
}

impl NvmImage {
    pub fn sections(&self) -> [(&'static str, &[u8]); 7] {
        [
            ("parameters", &self.parameters),
            ("samples", &self.samples),
            ("model", &self.model),
            ("nodes", &self.nodes),
            ("model_parameters_info", &self.model_parameters_info),
            ("intermediate_parameters_info", &self.intermediate_parameters_info),
            ("labels", &self.labels),
        ]
    }

    pub fn total_len(&self) -> usize {
        self.sections().iter().map(|(_, data)| data.len()).sum()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for (_, data) in self.sections() {
            w.write_all(data)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct BuildOutput {
    pub image: NvmImage,
    pub diagnostics: Diagnostics,
    /// Graph-wide maximum node arity; node records are padded to it.
    pub num_inputs: usize,
}

/// Assembles every section of the NVM image.
pub struct ImageBuilder<'a> {
    cfg: &'a DeviceConfig,
    graph: &'a Graph,
    norm: &'a Normalized,
    nodes: &'a [Node],
    samples: &'a SampleSet,
    verbose: bool,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(
        cfg: &'a DeviceConfig,
        graph: &'a Graph,
        norm: &'a Normalized,
        nodes: &'a [Node],
        samples: &'a SampleSet,
        verbose: bool,
    ) -> Self {
        Self {
            cfg,
            graph,
            norm,
            nodes,
            samples,
            verbose,
        }
    }

    pub fn build(&self) -> Result<BuildOutput> {
        ensure!(
            self.samples.dims == self.cfg.model.sample_size,
            "Sample dims {:?} do not match configured sample size {:?}",
            self.samples.dims,
            self.cfg.model.sample_size
        );

        let mut diag = Diagnostics::new();
        let mut image = NvmImage::default();

        write_model_header(&mut image.model, self.cfg)?;

        let num_inputs = max_input_count(self.nodes);
        let footprints = self.cfg.method.node_footprints();
        for node in self.nodes {
            let op_code = self
                .norm
                .ops
                .iter()
                .position(|op| op == &node.op_type)
                .with_context(|| format!("Operator {} missing from the operator table", node.op_type))?;
            write_node(&mut image.nodes, node, num_inputs, op_code as u16, footprints)?;
        }

        // The parameter table covers indices [0, n_input): graph inputs and
        // constants, in index order.
        let mut parameters: Vec<Option<&Initializer>> = vec![None; self.norm.n_input];
        for init in &self.graph.initializers {
            let idx = *self
                .norm
                .names
                .get(&init.name)
                .with_context(|| format!("Constant {:?} was never indexed", init.name))?;
            ensure!(
                idx < self.norm.n_input && parameters[idx].is_none(),
                "Constant {:?} clashes with another tensor at index {}",
                init.name,
                idx
            );
            parameters[idx] = Some(init);
        }

        let pb = if self.verbose {
            let pb = ProgressBar::new(parameters.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        let mut param_offset = 0usize;
        let mut record_index = 0u16;
        for (idx, entry) in parameters.iter().enumerate() {
            if let Some(ref pb) = pb {
                pb.set_position(idx as u64);
                let label = match entry {
                    Some(init) => init.name.clone(),
                    None => "input".to_string(),
                };
                pb.set_message(label);
            }
            match entry {
                None => self.write_input_record(&mut image, param_offset, record_index)?,
                Some(init) => {
                    self.write_constant(init, &mut image, &mut param_offset, record_index, &mut diag)?
                }
            }
            record_index += 1;
        }
        if let Some(pb) = pb {
            pb.finish_with_message("Done");
        }

        // Placeholders for every intermediate activation; the runtime fills
        // them in at execution time.
        for _ in self.nodes {
            let record = ParameterRecord {
                scale: self.cfg.model.scale,
                index: record_index,
                ..ParameterRecord::default()
            };
            record.write(&mut image.intermediate_parameters_info)?;
            record_index += 1;
        }

        for im in self.samples.images.iter().take(self.cfg.n_samples) {
            for &value in im {
                let code = to_q15(
                    value as f64 / self.cfg.model.input_scale as f64,
                    "Input",
                    &mut diag,
                );
                image.samples.write_i16::<LittleEndian>(code)?;
            }
        }
        for &label in self.samples.labels.iter().take(self.cfg.n_samples) {
            image.labels.push(label);
        }

        // Hard capacity bound: sections plus the reserved intermediate-value
        // slots must fit the device. Checked before anything is written out.
        let reserved =
            self.cfg.model.num_slots as usize * self.cfg.model.intermediate_values_size;
        let total = image.total_len() + reserved;
        ensure!(
            total <= self.cfg.nvm_size,
            "NVM image too large: {} section bytes + {} reserved intermediate bytes exceed capacity {}",
            image.total_len(),
            reserved,
            self.cfg.nvm_size
        );

        Ok(BuildOutput {
            image,
            diagnostics: diag,
            num_inputs,
        })
    }

    /// Record for a graph input. Sample data lives in the test-set slot;
    /// the dims describe one sample extended to a unit batch.
    fn write_input_record(
        &self,
        image: &mut NvmImage,
        offset: usize,
        index: u16,
    ) -> Result<()> {
        let sample_dims = &self.cfg.model.sample_size;
        ensure!(
            sample_dims.len() <= 3,
            "Sample dims {:?} exceed the 4-dim record field",
            sample_dims
        );
        let mut dims = [0u16; 4];
        dims[0] = 1;
        for (i, &dim) in sample_dims.iter().enumerate() {
            dims[i + 1] = dim as u16;
        }
        let record = ParameterRecord {
            offset: offset as u32,
            len: self.cfg.model.sample_bytes() as u32,
            bitwidth: 16,
            slot: SLOT_TEST_SET,
            dims,
            scale: self.cfg.model.input_scale,
            index,
            ..ParameterRecord::default()
        };
        record.write(&mut image.model_parameters_info)?;
        Ok(())
    }

    fn write_constant(
        &self,
        init: &Initializer,
        image: &mut NvmImage,
        param_offset: &mut usize,
        index: u16,
        diag: &mut Diagnostics,
    ) -> Result<()> {
        ensure!(
            init.dims.len() <= 4,
            "Constant {:?} has more than 4 dims: {:?}",
            init.name,
            init.dims
        );
        ensure!(init.data_len() > 0, "Constant {:?} has no data", init.name);

        let offset = *param_offset as u32;
        let mut flags = 0u8;
        let len;
        let bitwidth;
        match init.elem_type {
            ElemType::Float32 => {
                let mut float_data = init.float_data.clone();
                if self.norm.conv_param_names.contains(&init.name) {
                    if self.verbose {
                        println!("Reorder conv param {}", init.name);
                    }
                    float_data = nchw2nhwc(&float_data, &init.dims)?;
                }
                let codes = quantize(&float_data, self.cfg.model.scale as f64, &init.name, diag);
                let written = match self.merged_bias_for(init) {
                    Some(bias) => {
                        flags |= PARAM_FLAG_MERGED_BIAS;
                        self.write_merged_filter(image, init, &codes, bias, diag)?
                    }
                    None => {
                        for code in &codes {
                            image.parameters.write_i16::<LittleEndian>(*code)?;
                        }
                        codes.len()
                    }
                };
                len = written * 2;
                bitwidth = 16;
            }
            ElemType::Int64 => {
                for &value in &init.int64_data {
                    image.parameters.write_i64::<LittleEndian>(value)?;
                }
                len = init.int64_data.len() * 8;
                bitwidth = 64;
            }
        }
        *param_offset += len;

        let mut dims = [0u16; 4];
        for (i, &dim) in init.dims.iter().enumerate() {
            dims[i] = dim as u16;
        }
        let record = ParameterRecord {
            offset,
            len: len as u32,
            bitwidth,
            slot: SLOT_PARAMETERS,
            dims,
            scale: self.cfg.model.scale,
            flags,
            index,
            ..ParameterRecord::default()
        };
        record.write(&mut image.model_parameters_info)?;
        Ok(())
    }

    /// Bias initializer to interleave into this filter's payload, when bias
    /// merging is enabled and the consuming convolution carries one.
    fn merged_bias_for(&self, init: &Initializer) -> Option<&Initializer> {
        if !self.cfg.merge_bias || !self.norm.conv_param_names.contains(&init.name) {
            return None;
        }
        if init.dims.len() != 4 {
            return None;
        }
        let conv = self
            .norm
            .nodes
            .iter()
            .find(|n| n.op_type == "Conv" && n.inputs.get(1) == Some(&init.name))?;
        let bias_name = conv.inputs.get(2)?;
        let bias = self.graph.initializer(bias_name)?;
        (bias.elem_type == ElemType::Float32 && bias.dims == [init.dims[0]]).then_some(bias)
    }

    /// Channel-last filter blocks with each output channel's bias appended,
    /// every block padded to a whole Q15 pair.
    fn write_merged_filter(
        &self,
        image: &mut NvmImage,
        init: &Initializer,
        codes: &[i16],
        bias: &Initializer,
        diag: &mut Diagnostics,
    ) -> Result<usize> {
        let run = init.dims[1] * init.dims[2] * init.dims[3];
        // Bias sits on the convolution output scale: parameter scale
        // combined with the input scale.
        let bias_divisor = self.cfg.model.scale as f64 * self.cfg.model.input_scale as f64;
        let bias_codes = quantize(&bias.float_data, bias_divisor, &bias.name, diag);
        let mut written = 0usize;
        for (oc, block) in codes.chunks(run).enumerate() {
            for code in block {
                image.parameters.write_i16::<LittleEndian>(*code)?;
            }
            image.parameters.write_i16::<LittleEndian>(bias_codes[oc])?;
            written += run + 1;
            if (run + 1) % 2 == 1 {
                image.parameters.write_i16::<LittleEndian>(0)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

/// Reorder a 4-dim tensor from channel-first to channel-last, the layout
/// the target's vector math library expects.
pub fn nchw2nhwc(data: &[f32], dims: &[usize]) -> Result<Vec<f32>> {
    ensure!(dims.len() == 4, "Cannot reorder tensor with dims {:?}", dims);
    let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    ensure!(n * c * h * w == data.len(), "Dims {:?} do not cover {} elements", dims, data.len());
    let mut ret = vec![0.0f32; data.len()];
    for ni in 0..n {
        for ci in 0..c {
            for hi in 0..h {
                for wi in 0..w {
                    let old = ni * c * h * w + ci * h * w + hi * w + wi;
                    let new = ni * h * w * c + hi * w * c + wi * c + ci;
                    ret[new] = data[old];
                }
            }
        }
    }
    Ok(ret)
}
