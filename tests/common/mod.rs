//! Common test utilities for integration tests.
//!
//! [`ArchiveBuilder`] writes a model archive in the on-disk layout read by
//! `fedserve::archive`: a `define/define_meta.yaml` manifest plus one
//! protobuf-encoded payload file per component field.

use fedserve::archive::proto::{LrModelMeta, LrModelParam, NnModelMeta, NnModelParam, NnParam};
use fedserve::archive::ComponentField;
use fedserve::convert::pickle::{self, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

/// One component declared in the manifest.
struct ComponentSpec {
    name: String,
    module_name: String,
    alias: String,
    files: Vec<(String, ComponentField)>,
}

/// Builder for a temporary model archive.
#[derive(Default)]
pub struct ArchiveBuilder {
    components: Vec<ComponentSpec>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a component with payloads under the `model` alias.
    pub fn component(
        self,
        name: &str,
        module_name: &str,
        files: Vec<(&str, ComponentField)>,
    ) -> Self {
        self.component_with_alias(name, module_name, "model", files)
    }

    pub fn component_with_alias(
        mut self,
        name: &str,
        module_name: &str,
        alias: &str,
        files: Vec<(&str, ComponentField)>,
    ) -> Self {
        self.components.push(ComponentSpec {
            name: name.to_string(),
            module_name: module_name.to_string(),
            alias: alias.to_string(),
            files: files
                .into_iter()
                .map(|(stored, field)| (stored.to_string(), field))
                .collect(),
        });
        self
    }

    /// Write the archive into a fresh temporary directory.
    pub fn build(self) -> TempDir {
        let dir = TempDir::new().expect("Failed to create temp directory");
        self.write_to(dir.path());
        dir
    }

    pub fn write_to(&self, root: &Path) {
        std::fs::create_dir_all(root.join("define/proto")).expect("Failed to create define dir");
        std::fs::create_dir_all(root.join("variables/index")).expect("Failed to create index dir");
        std::fs::write(root.join("define/define_meta.yaml"), self.manifest())
            .expect("Failed to write manifest");

        for component in &self.components {
            let data = root
                .join("variables/data")
                .join(&component.name)
                .join(&component.alias);
            std::fs::create_dir_all(&data).expect("Failed to create data dir");
            for (stored, field) in &component.files {
                std::fs::write(data.join(stored), field.encode_to_vec())
                    .expect("Failed to write payload");
            }
        }
    }

    fn manifest(&self) -> String {
        let mut yaml = String::from("component_define:\n");
        for component in &self.components {
            yaml.push_str(&format!(
                "  {}:\n    module_name: {}\n",
                component.name, component.module_name
            ));
        }
        yaml.push_str("model_proto:\n");
        for component in self.components.iter().filter(|c| !c.files.is_empty()) {
            yaml.push_str(&format!("  {}:\n    {}:\n", component.name, component.alias));
            for (stored, field) in &component.files {
                yaml.push_str(&format!("      {}: {}\n", stored, field.message_name()));
            }
        }
        yaml
    }
}

/// `HomoLR` parameters with weights given in arbitrary order.
pub fn lr_param(header: &[&str], weights: &[(&str, f64)], intercept: f64) -> ComponentField {
    ComponentField::LrModelParam(LrModelParam {
        iters: 10,
        weight: weights
            .iter()
            .map(|(name, w)| (name.to_string(), *w))
            .collect::<HashMap<_, _>>(),
        intercept,
        header: header.iter().map(|s| s.to_string()).collect(),
        is_converged: true,
        ..Default::default()
    })
}

pub fn lr_meta() -> ComponentField {
    ComponentField::LrModelMeta(LrModelMeta {
        penalty: "L2".to_string(),
        optimizer: "sgd".to_string(),
        fit_intercept: true,
        ..Default::default()
    })
}

pub fn nn_meta(config_type: &str) -> ComponentField {
    ComponentField::NnModelMeta(NnModelMeta {
        aggregate_type: "weighted_mean".to_string(),
        params: Some(NnParam {
            num_party: 2,
            config_type: config_type.to_string(),
            ..Default::default()
        }),
    })
}

pub fn nn_param(checkpoint: Vec<u8>, api_version: i32) -> ComponentField {
    ComponentField::NnModelParam(NnModelParam {
        aggregate_iter: 5,
        saved_model_bytes: checkpoint.into(),
        api_version,
        ..Default::default()
    })
}

/// Minimal `torch.save` style zip archive.
pub fn checkpoint_bytes() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer
        .start_file("archive/data.pkl", options)
        .expect("Failed to start data.pkl");
    writer.write_all(b"\x80\x02}q\x00.").expect("Failed to write data.pkl");
    writer
        .start_file("archive/version", options)
        .expect("Failed to start version");
    writer.write_all(b"3\n").expect("Failed to write version");
    writer.finish().expect("Failed to finish checkpoint").into_inner()
}

/// `_rebuild_tensor_v2` call over the float storage `key`.
fn tensor(key: &str, numel: i64) -> Value {
    let storage = Value::PersistentId(Box::new(Value::Tuple(vec![
        Value::Str("storage".into()),
        Value::global("torch", "FloatStorage"),
        Value::Str(key.into()),
        Value::Str("cpu".into()),
        Value::Int(numel),
    ])));
    Value::Object {
        callable: Box::new(Value::global("torch._utils", "_rebuild_tensor_v2")),
        args: Box::new(Value::Tuple(vec![
            storage,
            Value::Int(0),
            Value::Tuple(vec![Value::Int(numel)]),
            Value::Tuple(vec![Value::Int(1)]),
            Value::Bool(false),
            Value::ordered_dict(Vec::new()),
        ])),
        new_object: false,
        items: Vec::new(),
        state: None,
    }
}

/// Lightning checkpoint as written by the federated trainer: the module's
/// parameters under `model.` plus a classifier head and optimizer state.
pub fn lightning_checkpoint_bytes() -> Vec<u8> {
    let key = |name: &str| Value::Str(name.to_string());
    let state_dict = Value::ordered_dict(vec![
        (key("model.0.weight"), tensor("0", 6)),
        (key("model.0.bias"), tensor("1", 2)),
        (key("loss_fn.pos_weight"), tensor("2", 1)),
    ]);
    let root = Value::Dict(vec![
        (key("epoch"), Value::Int(9)),
        (key("state_dict"), state_dict),
        (
            key("optimizer_states"),
            Value::List(vec![Value::Dict(vec![(key("lr"), Value::Float(0.01))])]),
        ),
    ]);

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer
        .start_file("archive/data.pkl", options)
        .expect("Failed to start data.pkl");
    writer
        .write_all(&pickle::dumps(&root))
        .expect("Failed to write data.pkl");
    for (name, size) in [("0", 24), ("1", 8), ("2", 4)] {
        writer
            .start_file(format!("archive/data/{}", name), options)
            .expect("Failed to start storage");
        writer.write_all(&vec![7u8; size]).expect("Failed to write storage");
    }
    writer
        .start_file("archive/version", options)
        .expect("Failed to start version");
    writer.write_all(b"3\n").expect("Failed to write version");
    writer.finish().expect("Failed to finish checkpoint").into_inner()
}

/// A single `HomoLR` component next to unsupported pipeline components.
pub fn lr_archive() -> TempDir {
    ArchiveBuilder::new()
        .component("reader_0", "Reader", vec![])
        .component("data_transform_0", "DataTransform", vec![])
        .component(
            "homo_lr_0",
            "HomoLR",
            vec![
                ("HomoLogisticRegressionMeta", lr_meta()),
                (
                    "HomoLogisticRegressionParam",
                    lr_param(&["x0", "x1", "x2"], &[("x2", 0.3), ("x0", 0.1), ("x1", -0.2)], 0.5),
                ),
            ],
        )
        .build()
}

/// A single `HomoNN` component with the given config type. Non-zero API
/// versions store a trainer checkpoint.
pub fn nn_archive(config_type: &str, api_version: i32) -> TempDir {
    let checkpoint = if api_version > 0 {
        lightning_checkpoint_bytes()
    } else {
        checkpoint_bytes()
    };
    nn_archive_with(config_type, checkpoint, api_version)
}

/// A single `HomoNN` component storing `checkpoint`.
pub fn nn_archive_with(config_type: &str, checkpoint: Vec<u8>, api_version: i32) -> TempDir {
    ArchiveBuilder::new()
        .component("reader_0", "Reader", vec![])
        .component(
            "homo_nn_0",
            "HomoNN",
            vec![
                ("HomoNNModelMeta", nn_meta(config_type)),
                ("HomoNNModelParam", nn_param(checkpoint, api_version)),
            ],
        )
        .build()
}
