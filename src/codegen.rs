//! Generated C declarations for the inference runtime.
//!
//! The runtime never parses the image layout at run time; it is compiled
//! against `data.h`/`data.cpp`, so every configuration constant, operator
//! code, and section byte array is emitted here and the two sides can never
//! disagree on the binary's shape.

use crate::config::{
    DeviceConfig, ARM_PSTATE_LEN, DEFAULT_TILE_C, DEFAULT_TILE_H, EXTRA_INFO_LEN, NODE_NAME_LEN,
    TEMP_FILTER_WIDTH, TURNING_POINTS_LEN,
};
use crate::flags::GENERIC_FLAG_NAMES;
use crate::normalize::INPLACE_UPDATE_OPS;
use crate::nvm_format::{
    NvmImage, SLOT_CONSTANTS_MIN, SLOT_INTERMEDIATE_VALUES, SLOT_PARAMETERS, SLOT_TEST_SET,
};

pub struct Declarations {
    pub header: String,
    pub source: String,
}

pub struct CodegenInfo<'a> {
    pub cfg: &'a DeviceConfig,
    pub ops: &'a [String],
    pub image: &'a NvmImage,
    pub n_input: usize,
    /// Maximum node arity; node records are padded to it.
    pub num_inputs: usize,
    pub model_nodes_len: usize,
}

enum ConstValue {
    Int(i64),
    Float(f64),
    Str(String),
    /// Emitted verbatim (lists, suffixed literals).
    Raw(String),
}

pub fn generate(info: &CodegenInfo) -> Declarations {
    let mut header = String::from(
        "\n#pragma once\n\n#include <stdint.h>\n\nstruct ParameterInfo;\nstruct Model;\nstruct Node;\n\n",
    );
    let mut source = String::from("\n#include \"data.h\"\n#include \"cnn_common.h\"\n#include \"platform.h\"\n");

    for (name, value) in constants(info) {
        header.push_str(&format!("#define {} ", name));
        match value {
            ConstValue::Int(v) => header.push_str(&v.to_string()),
            ConstValue::Float(v) => header.push_str(&v.to_string()),
            ConstValue::Str(v) => header.push_str(&format!("\"{}\"", v)),
            ConstValue::Raw(v) => header.push_str(&v),
        }
        header.push('\n');
    }

    // Operator codes match the node records' op table indices.
    header.push('\n');
    for (idx, op) in info.ops.iter().enumerate() {
        header.push_str(&format!("#define Op{} {}\n", op, idx));
    }
    for op in info.ops {
        header.push_str(&format!(
            "void alloc_{}(struct Model *model, const struct ParameterInfo *input[], struct ParameterInfo *output, const struct Node* node);\n",
            op.to_lowercase()
        ));
        header.push_str(&format!(
            "void handle_{}(struct Model *model, const struct ParameterInfo *input[], struct ParameterInfo *output, const struct Node* node);\n",
            op.to_lowercase()
        ));
    }
    source.push_str("const handler handlers[] = {\n");
    for op in info.ops {
        source.push_str(&format!("    handle_{},\n", op.to_lowercase()));
    }
    source.push_str("};\n");
    source.push_str("const allocator allocators[] = {\n");
    for op in info.ops {
        source.push_str(&format!("    alloc_{},\n", op.to_lowercase()));
    }
    source.push_str("};\n");
    for op in info.ops {
        if INPLACE_UPDATE_OPS.contains(&op.as_str()) {
            source.push_str(&format!(
                "\nvoid alloc_{}(struct Model *model, const struct ParameterInfo *[], struct ParameterInfo *output, const struct Node*) {{\n    SlotInfo *cur_slot_info = get_slot_info(model, output->slot);\n    if (cur_slot_info) {{\n        cur_slot_info->user = model->layer_idx;\n    }}\n}}\n",
                op.to_lowercase()
            ));
        }
    }

    header.push('\n');
    for (idx, name) in GENERIC_FLAG_NAMES.iter().enumerate() {
        header.push_str(&format!("#define {} {}\n", name, 1u32 << idx));
    }

    let sample_bytes = info.cfg.model.sample_bytes();
    for (name, data) in info.image.sections() {
        let var_name = format!("{}_data", name);
        // Only the first sample is compiled in; the rest live in the
        // separate samples binary.
        let data = if name == "samples" {
            &data[..sample_bytes.min(data.len())]
        } else {
            data
        };
        define_var(&mut header, &mut source, &var_name, data);
    }

    Declarations { header, source }
}

fn constants(info: &CodegenInfo) -> Vec<(String, ConstValue)> {
    let cfg = info.cfg;
    let model = &cfg.model;
    let method = cfg.method;
    let as_int = |b: bool| ConstValue::Int(b as i64);
    let float_list = |values: &[f64]| {
        ConstValue::Raw(format!(
            "{{{}}}",
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    };

    let mut entries: Vec<(String, ConstValue)> = vec![
        ("ARM_PSTATE_LEN".into(), ConstValue::Int(ARM_PSTATE_LEN as i64)),
        ("BATCH_SIZE".into(), ConstValue::Int(cfg.batch_size as i64)),
        ("CONFIG".into(), ConstValue::Str(model.name.clone())),
        ("DEFAULT_TILE_C".into(), ConstValue::Int(DEFAULT_TILE_C as i64)),
        ("DEFAULT_TILE_H".into(), ConstValue::Int(DEFAULT_TILE_H as i64)),
        ("EXTRA_INFO_LEN".into(), ConstValue::Int(EXTRA_INFO_LEN as i64)),
        (
            "FIRST_SAMPLE_OUTPUTS".into(),
            float_list(&model.first_sample_outputs),
        ),
        ("FP32_ACCURACY".into(), ConstValue::Float(model.fp32_accuracy)),
        (
            "HAWAII".into(),
            as_int(method == crate::config::RecoveryMethod::Hawaii),
        ),
        ("INDIRECT_RECOVERY".into(), as_int(method.indirect_recovery())),
        ("INPUT_SCALE".into(), ConstValue::Int(model.input_scale as i64)),
        (
            "INTERMEDIATE_VALUES_SIZE".into(),
            // Long literal: products like INTERMEDIATE_VALUES_SIZE * NUM_SLOTS
            // overflow 16-bit int arithmetic otherwise.
            ConstValue::Raw(format!("{}l", model.intermediate_values_size)),
        ),
        ("INTERMITTENT".into(), as_int(method.is_intermittent())),
        (
            "JAPARI".into(),
            as_int(method == crate::config::RecoveryMethod::Japari),
        ),
        ("METHOD".into(), ConstValue::Str(method.as_str().into())),
        ("MODEL_NODES_LEN".into(), ConstValue::Int(info.model_nodes_len as i64)),
        ("NODE_NAME_LEN".into(), ConstValue::Int(NODE_NAME_LEN as i64)),
        ("NUM_INPUTS".into(), ConstValue::Int(info.num_inputs as i64)),
        ("NUM_SLOTS".into(), ConstValue::Int(model.num_slots as i64)),
        ("NVM_SIZE".into(), ConstValue::Int(cfg.nvm_size as i64)),
        ("N_ALL_SAMPLES".into(), ConstValue::Int(model.n_all_samples as i64)),
        ("N_INPUT".into(), ConstValue::Int(info.n_input as i64)),
        ("N_SAMPLES".into(), ConstValue::Int(cfg.n_samples as i64)),
        ("OP_FILTERS".into(), ConstValue::Int(model.op_filters as i64)),
        (
            "SAMPLE_SIZE".into(),
            ConstValue::Raw(format!(
                "{{{}}}",
                model
                    .sample_size
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        ),
        ("SCALE".into(), ConstValue::Int(model.scale as i64)),
        (
            "SCRATCH_BUFFER_SIZE".into(),
            ConstValue::Int(cfg.scratch_buffer_size as i64),
        ),
        ("SLOT_CONSTANTS_MIN".into(), ConstValue::Int(SLOT_CONSTANTS_MIN as i64)),
        (
            "SLOT_INTERMEDIATE_VALUES".into(),
            ConstValue::Int(SLOT_INTERMEDIATE_VALUES as i64),
        ),
        ("SLOT_PARAMETERS".into(), ConstValue::Int(SLOT_PARAMETERS as i64)),
        ("SLOT_TEST_SET".into(), ConstValue::Int(SLOT_TEST_SET as i64)),
        (
            "STATEFUL".into(),
            as_int(method == crate::config::RecoveryMethod::Stateful),
        ),
        ("TEMP_FILTER_WIDTH".into(), ConstValue::Int(TEMP_FILTER_WIDTH as i64)),
        (
            "TOTAL_SAMPLE_SIZE".into(),
            ConstValue::Int(model.sample_size.iter().product::<usize>() as i64),
        ),
        ("TURNING_POINTS_LEN".into(), ConstValue::Int(TURNING_POINTS_LEN as i64)),
        ("USE_ARM_CMSIS".into(), as_int(cfg.target.use_arm_cmsis())),
    ];
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn define_var(header: &mut String, source: &mut String, var_name: &str, data: &[u8]) {
    header.push_str(&format!(
        "\nextern const uint8_t * const {};\n#define {}_LEN {}\n",
        var_name,
        var_name.to_uppercase(),
        data.len()
    ));
    source.push_str(&format!("\nconst uint8_t _{}[{}] = {{\n", var_name, data.len()));
    for chunk in data.chunks(16) {
        let line: Vec<String> = chunk.iter().map(|b| format!("0x{:02x}", b)).collect();
        source.push_str(&format!("  {},\n", line.join(", ")));
    }
    source.push_str(&format!(
        "}};\nconst uint8_t * const {} = _{};\n",
        var_name, var_name
    ));
}
