//! End-to-end pipeline tests over a small MNIST-shaped fixture graph:
//! conv → pool → flatten → fully-connected → bias add → softmax, with a
//! constant-fed squeeze feeding the add.

use std::collections::HashMap;

use emberc::codegen::{self, CodegenInfo};
use emberc::config::{DeviceConfig, ModelConfig, RecoveryMethod, Target};
use emberc::flags::OpFlags;
use emberc::graph::{Attribute, ElemType, Graph, GraphNode, Initializer, SampleSet, ValueShape};
use emberc::normalize::{self, Normalized};
use emberc::nvm_format::{
    model_header_size, node_record_size, ImageBuilder, BuildOutput, PARAMETER_RECORD_SIZE,
    PARAM_FLAG_MERGED_BIAS, SLOT_PARAMETERS, SLOT_TEST_SET,
};
use emberc::tiling;

fn node(op: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> GraphNode {
    GraphNode {
        name: name.into(),
        op_type: op.into(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        attributes: HashMap::new(),
    }
}

fn float_init(name: &str, dims: &[usize], value: f32) -> Initializer {
    Initializer {
        name: name.into(),
        elem_type: ElemType::Float32,
        dims: dims.to_vec(),
        float_data: vec![value; dims.iter().product()],
        int64_data: vec![],
    }
}

fn fixture_graph() -> Graph {
    let mut conv = node(
        "Conv",
        "conv1",
        &["input", "conv1_w", "conv1_b"],
        &["conv1_out"],
    );
    conv.attributes
        .insert("pads".into(), Attribute::Ints(vec![2, 2, 2, 2]));
    conv.attributes
        .insert("strides".into(), Attribute::Ints(vec![1, 1]));

    let mut pool = node("MaxPool", "pool1", &["conv1_out"], &["pool1_out"]);
    pool.attributes
        .insert("kernel_shape".into(), Attribute::Ints(vec![2, 2]));
    pool.attributes
        .insert("strides".into(), Attribute::Ints(vec![2, 2]));

    let flatten = node("Reshape", "flatten", &["pool1_out", "shape_const"], &["flat"]);
    let gemm = node("Gemm", "fc", &["flat", "fc_w", "fc_b"], &["fc_out"]);

    let mut squeeze = node("Squeeze", "cls_squeeze", &["cls_w"], &["cls_w_sq"]);
    squeeze
        .attributes
        .insert("axes".into(), Attribute::Ints(vec![0]));
    let add = node("Add", "bias_add", &["fc_out", "cls_w_sq"], &["scores"]);
    let softmax = node("Softmax", "sm", &["scores"], &["probs"]);

    let shape_const = Initializer {
        name: "shape_const".into(),
        elem_type: ElemType::Int64,
        dims: vec![2],
        float_data: vec![],
        int64_data: vec![1, 1568],
    };

    let mut conv1_w = float_init("conv1_w", &[8, 1, 5, 5], 0.05);
    // One out-of-range weight: 3.0 / scale 2 = 1.5, clamps with a diagnostic.
    conv1_w.float_data[0] = 3.0;

    Graph {
        name: "mnist-fixture".into(),
        inputs: vec![ValueShape {
            name: "input".into(),
            dims: vec![1, 1, 28, 28],
        }],
        outputs: vec![ValueShape {
            name: "probs".into(),
            dims: vec![1, 10],
        }],
        nodes: vec![conv, pool, flatten, gemm, squeeze, add, softmax],
        initializers: vec![
            conv1_w,
            float_init("conv1_b", &[8], 0.1),
            float_init("fc_w", &[1568, 10], 0.01),
            float_init("fc_b", &[10], 0.1),
            shape_const,
            float_init("cls_w", &[1, 10], 0.2),
        ],
        value_shapes: vec![
            ValueShape {
                name: "conv1_out".into(),
                dims: vec![1, 8, 28, 28],
            },
            ValueShape {
                name: "pool1_out".into(),
                dims: vec![1, 8, 14, 14],
            },
            ValueShape {
                name: "flat".into(),
                dims: vec![1, 1568],
            },
            ValueShape {
                name: "fc_out".into(),
                dims: vec![1, 10],
            },
            ValueShape {
                name: "scores".into(),
                dims: vec![1, 10],
            },
        ],
    }
}

fn fixture_config(method: RecoveryMethod, merge_bias: bool) -> DeviceConfig {
    DeviceConfig::new(
        Target::Msp430,
        method,
        1,
        false,
        merge_bias,
        ModelConfig {
            name: "mnist".into(),
            scale: 2,
            input_scale: 4,
            num_slots: 2,
            intermediate_values_size: 26000,
            op_filters: 4,
            sample_size: vec![1, 28, 28],
            n_all_samples: 100,
            first_sample_outputs: vec![],
            fp32_accuracy: 0.989,
        },
    )
}

fn fixture_samples() -> SampleSet {
    SampleSet {
        dims: vec![1, 28, 28],
        images: vec![vec![0.25; 784], vec![0.5; 784]],
        labels: vec![7, 2],
    }
}

fn compile(cfg: &DeviceConfig) -> (Graph, Normalized, Vec<normalize::Node>, BuildOutput) {
    let mut graph = fixture_graph();
    let mut norm = normalize::normalize(&mut graph).unwrap();
    tiling::plan(&mut norm, &graph, cfg).unwrap();
    let nodes = normalize::freeze(&norm).unwrap();
    let samples = fixture_samples();
    let out = ImageBuilder::new(cfg, &graph, &norm, &nodes, &samples, false)
        .build()
        .unwrap();
    (graph, norm, nodes, out)
}

#[test]
fn normalization_rewrites_the_fixture_as_expected() {
    let cfg = fixture_config(RecoveryMethod::Baseline, false);
    let (graph, norm, nodes, _) = compile(&cfg);

    let ops: Vec<&str> = nodes.iter().map(|n| n.op_type.as_str()).collect();
    assert_eq!(
        ops,
        vec![
            "Conv", "ConvMerge", "MaxPool", "Reshape", "Gemm", "GemmMerge", "Add", "Softmax"
        ]
    );
    // The constant-fed squeeze folded into its initializer.
    assert_eq!(graph.initializer("cls_w").unwrap().dims, vec![10]);
    assert_eq!(norm.n_input, 7);
    assert_eq!(nodes[6].inputs[1], norm.names["cls_w"]);

    // Index invariant: inputs reference only inputs or earlier nodes.
    for (idx, n) in nodes.iter().enumerate() {
        for &inp in &n.inputs {
            assert!(
                inp < norm.n_input + idx,
                "node {} references future tensor {}",
                n.name,
                inp
            );
        }
    }

    // Liveness invariant: every consumer is covered by max_output_id.
    for (idx, n) in nodes.iter().enumerate() {
        for &inp in &n.inputs {
            if inp >= norm.n_input {
                assert!(nodes[inp - norm.n_input].max_output_id >= idx as u16);
            }
        }
    }

    assert_eq!(
        norm.ops,
        vec![
            "Add", "Conv", "ConvMerge", "Gemm", "GemmMerge", "MaxPool", "Reshape", "Softmax",
            "Squeeze"
        ]
    );
}

#[test]
fn tiling_fits_both_budgets_on_the_fixture() {
    let cfg = fixture_config(RecoveryMethod::Baseline, false);
    let (_, norm, _, _) = compile(&cfg);

    assert_eq!(
        norm.nodes[0].flags.extra,
        OpFlags::Conv {
            input_tile_c: 1,
            output_tile_c: 8
        }
    );
    assert_eq!(
        norm.nodes[4].flags.extra,
        OpFlags::Gemm {
            tile_channel: 36,
            tile_width: 4
        }
    );
}

#[test]
fn sections_have_the_declared_fixed_widths() {
    let cfg = fixture_config(RecoveryMethod::Baseline, false);
    let (_, norm, nodes, out) = compile(&cfg);

    assert_eq!(out.num_inputs, 3);
    assert_eq!(out.image.model.len(), model_header_size(&cfg));
    assert_eq!(
        out.image.nodes.len(),
        nodes.len() * node_record_size(out.num_inputs, false)
    );
    assert_eq!(
        out.image.model_parameters_info.len(),
        norm.n_input * PARAMETER_RECORD_SIZE
    );
    assert_eq!(
        out.image.intermediate_parameters_info.len(),
        nodes.len() * PARAMETER_RECORD_SIZE
    );
    // conv1_w + conv1_b + fc_w + fc_b as Q15, shape_const as int64, cls_w as Q15
    let expected_params = (200 + 8 + 15680 + 10) * 2 + 2 * 8 + 10 * 2;
    assert_eq!(out.image.parameters.len(), expected_params);
    assert_eq!(out.image.samples.len(), 2 * 784 * 2);
    assert_eq!(out.image.labels.len(), 2);

    // The out-of-range conv weight was clamped and reported, not fatal.
    assert_eq!(out.diagnostics.overflows().len(), 1);
    assert_eq!(out.diagnostics.overflows()[0].tensor, "conv1_w");
}

#[test]
fn hawaii_appends_footprint_counters_to_node_records() {
    let baseline = fixture_config(RecoveryMethod::Baseline, false);
    let hawaii = fixture_config(RecoveryMethod::Hawaii, false);
    let (_, _, nodes, base_out) = compile(&baseline);
    let (_, _, _, hawaii_out) = compile(&hawaii);

    assert_eq!(
        hawaii_out.image.nodes.len() - base_out.image.nodes.len(),
        nodes.len() * 8
    );
    // The model header only grows under indirect recovery.
    assert_eq!(hawaii_out.image.model.len(), base_out.image.model.len());

    let stateful = fixture_config(RecoveryMethod::Stateful, false);
    let (_, _, _, stateful_out) = compile(&stateful);
    assert!(stateful_out.image.model.len() > base_out.image.model.len());
}

#[test]
fn first_parameter_records_describe_inputs_then_constants() {
    let cfg = fixture_config(RecoveryMethod::Baseline, false);
    let (_, _, _, out) = compile(&cfg);
    let info = &out.image.model_parameters_info;

    // Record 0: the graph input, stored in the test-set slot.
    let input_record = &info[..PARAMETER_RECORD_SIZE];
    assert_eq!(input_record[9], SLOT_TEST_SET);
    assert_eq!(
        u32::from_le_bytes(input_record[4..8].try_into().unwrap()),
        (2 * 784) as u32
    );
    // dims [1, 1, 28, 28]
    assert_eq!(
        &input_record[12..20],
        &[1, 0, 1, 0, 28, 0, 28, 0]
    );

    // Record 1: the first constant, stored in the parameters slot at offset 0.
    let w_record = &info[PARAMETER_RECORD_SIZE..2 * PARAMETER_RECORD_SIZE];
    assert_eq!(w_record[9], SLOT_PARAMETERS);
    assert_eq!(u32::from_le_bytes(w_record[..4].try_into().unwrap()), 0);
    assert_eq!(w_record[8], 16); // bitwidth
}

#[test]
fn repeated_runs_produce_identical_images() {
    let cfg = fixture_config(RecoveryMethod::Stateful, false);
    let (_, _, _, first) = compile(&cfg);
    let (_, _, _, second) = compile(&cfg);
    for ((name, a), (_, b)) in first.image.sections().iter().zip(second.image.sections()) {
        assert_eq!(a, &b, "section {} differs between runs", name);
    }
}

#[test]
fn merged_bias_interleaves_into_the_filter_payload() {
    let plain = fixture_config(RecoveryMethod::Baseline, false);
    let merged = fixture_config(RecoveryMethod::Baseline, true);
    let (_, _, _, plain_out) = compile(&plain);
    let (_, _, _, merged_out) = compile(&merged);

    // Filter run 1*5*5 = 25, plus one bias element per output channel makes
    // an even 26-element block: 8 extra elements in total.
    assert_eq!(
        merged_out.image.parameters.len() - plain_out.image.parameters.len(),
        8 * 2
    );
    let info = &merged_out.image.model_parameters_info;
    let w_record = &info[PARAMETER_RECORD_SIZE..2 * PARAMETER_RECORD_SIZE];
    assert_eq!(
        u32::from_le_bytes(w_record[4..8].try_into().unwrap()),
        (8 * 26 * 2) as u32
    );
    assert_eq!(w_record[22] & PARAM_FLAG_MERGED_BIAS, PARAM_FLAG_MERGED_BIAS);
}

#[test]
fn image_exceeding_nvm_capacity_is_fatal() {
    let mut cfg = fixture_config(RecoveryMethod::Baseline, false);
    cfg.nvm_size = 1000;

    let mut graph = fixture_graph();
    let mut norm = normalize::normalize(&mut graph).unwrap();
    tiling::plan(&mut norm, &graph, &cfg).unwrap();
    let nodes = normalize::freeze(&norm).unwrap();
    let samples = fixture_samples();
    let err = ImageBuilder::new(&cfg, &graph, &norm, &nodes, &samples, false)
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("NVM image too large"));
}

#[test]
fn generated_declarations_match_the_image() {
    let cfg = fixture_config(RecoveryMethod::Baseline, false);
    let (_, norm, nodes, out) = compile(&cfg);
    let decls = codegen::generate(&CodegenInfo {
        cfg: &cfg,
        ops: &norm.ops,
        image: &out.image,
        n_input: norm.n_input,
        num_inputs: out.num_inputs,
        model_nodes_len: nodes.len(),
    });

    assert!(decls.header.contains("#define N_INPUT 7\n"));
    assert!(decls.header.contains("#define NUM_INPUTS 3\n"));
    assert!(decls.header.contains("#define MODEL_NODES_LEN 8\n"));
    assert!(decls.header.contains("#define OpConvMerge 2\n"));
    assert!(decls.header.contains(&format!(
        "#define NODES_DATA_LEN {}\n",
        out.image.nodes.len()
    )));
    // One sample's worth of bytes is compiled in.
    assert!(decls.header.contains("#define SAMPLES_DATA_LEN 1568\n"));
    assert!(decls.source.contains("handle_gemmmerge,"));
}

#[test]
fn image_writes_every_section_to_disk() {
    let cfg = fixture_config(RecoveryMethod::Baseline, false);
    let (_, _, _, out) = compile(&cfg);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    let mut file = std::fs::File::create(&path).unwrap();
    out.image.write_to(&mut file).unwrap();
    drop(file);

    let written = std::fs::metadata(&path).unwrap().len() as usize;
    assert_eq!(written, out.image.total_len());
}
