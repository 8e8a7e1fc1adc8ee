//! Neural-network conversion to a PyTorch checkpoint.

use super::pickle::{self, Value};
use super::{ComponentConverter, NativeModel};
use crate::archive::ComponentRecord;
use crate::error::{FedServeError, Result};
use bytes::Bytes;
use std::collections::HashSet;
use std::fmt::Display;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::ZipArchive;

/// Component types handled by [`NnComponentConverter`].
pub const TARGET_MODULES: &[&str] = &["HomoNN"];

/// Config type a `HomoNN` component must declare to be convertible.
pub const PYTORCH_CONFIG_TYPE: &str = "pytorch";

/// Prefix of the wrapped module's entries in a trainer state dict.
pub const MODULE_PREFIX: &str = "model.";

/// Magic number pickled at the head of a legacy checkpoint.
const LEGACY_MAGIC: [u8; 10] = [0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19];

/// How the stored checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointLoad {
    /// Lightning checkpoint written by the federated trainer; the module is
    /// its `model` attribute.
    FederatedLightning,
    /// Plain pickled `torch.nn.Module`.
    Module,
}

impl CheckpointLoad {
    /// Non-zero API versions mark trainer-written checkpoints.
    pub fn from_api_version(api_version: i32) -> Self {
        if api_version > 0 {
            CheckpointLoad::FederatedLightning
        } else {
            CheckpointLoad::Module
        }
    }
}

/// Container format of a `torch.save` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Zip archive with a `data.pkl` record, the default since PyTorch 1.6.
    Zip,
    /// Pickles followed by raw storages (`_use_new_zipfile_serialization=False`).
    Legacy,
}

impl CheckpointFormat {
    pub fn detect(checkpoint: &[u8]) -> Result<Self> {
        if checkpoint.starts_with(b"PK\x03\x04") {
            let archive = ZipArchive::new(Cursor::new(checkpoint)).map_err(invalid)?;
            if !archive.file_names().any(|name| name.ends_with("data.pkl")) {
                return Err(invalid("archive has no data.pkl record"));
            }
            return Ok(CheckpointFormat::Zip);
        }
        if checkpoint.first() == Some(&0x80) {
            let (magic, _) = pickle::load_prefix(checkpoint)?;
            if magic == Value::Long(LEGACY_MAGIC.to_vec()) {
                return Ok(CheckpointFormat::Legacy);
            }
            return Err(invalid("pickle stream lacks the torch.save magic number"));
        }
        Err(invalid("neither a zip archive nor a legacy pickle stream"))
    }
}

fn invalid(reason: impl Display) -> FedServeError {
    FedServeError::InvalidCheckpoint(reason.to_string())
}

/// A PyTorch checkpoint ready to serve.
#[derive(Debug, Clone, PartialEq)]
pub struct TorchModule {
    load: CheckpointLoad,
    format: CheckpointFormat,
    checkpoint: Bytes,
}

impl TorchModule {
    /// Validate `source` and unwrap trainer checkpoints.
    ///
    /// A plain module checkpoint is kept as is. A trainer checkpoint is
    /// rewritten into a checkpoint of the wrapped module's state dict.
    pub fn from_checkpoint(source: Bytes, load: CheckpointLoad) -> Result<Self> {
        let format = CheckpointFormat::detect(&source)?;
        let checkpoint = match (load, format) {
            (CheckpointLoad::Module, _) => source,
            (CheckpointLoad::FederatedLightning, CheckpointFormat::Zip) => extract_module_state(&source)?,
            (CheckpointLoad::FederatedLightning, CheckpointFormat::Legacy) => {
                return Err(invalid(
                    "trainer checkpoints must use the zip format; the legacy format is only read for plain modules",
                ))
            }
        };
        Ok(Self {
            load,
            format,
            checkpoint,
        })
    }

    pub fn load(&self) -> CheckpointLoad {
        self.load
    }

    pub fn format(&self) -> CheckpointFormat {
        self.format
    }

    /// Whether the checkpoint holds a state dict rather than a pickled module.
    pub fn is_state_dict(&self) -> bool {
        self.load == CheckpointLoad::FederatedLightning
    }

    /// Bytes to serve.
    pub fn checkpoint(&self) -> &Bytes {
        &self.checkpoint
    }

    /// Write the checkpoint to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.checkpoint)?;
        Ok(())
    }
}

/// Rewrite a trainer checkpoint into one holding only the wrapped module's
/// state dict, with the `model.` prefix stripped and unreferenced storages
/// dropped.
pub fn extract_module_state(checkpoint: &[u8]) -> Result<Bytes> {
    let mut archive = ZipArchive::new(Cursor::new(checkpoint)).map_err(invalid)?;
    let pkl_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| invalid("archive has no data.pkl record"))?;
    let record_prefix = pkl_name
        .strip_suffix("data.pkl")
        .unwrap_or_default()
        .to_string();

    let mut data = Vec::new();
    archive
        .by_name(&pkl_name)
        .map_err(invalid)?
        .read_to_end(&mut data)?;
    let root = pickle::loads(&data)?;
    let state_dict = root
        .get("state_dict")
        .and_then(Value::items)
        .ok_or_else(|| invalid("trainer checkpoint has no state_dict"))?;

    let module_items: Vec<(Value, Value)> = state_dict
        .iter()
        .filter_map(|(key, value)| {
            let name = key.as_str()?.strip_prefix(MODULE_PREFIX)?;
            Some((Value::Str(name.to_string()), value.clone()))
        })
        .collect();
    if module_items.is_empty() {
        return Err(invalid(format!(
            "state_dict has no {}* entries",
            MODULE_PREFIX
        )));
    }
    let module_state = Value::ordered_dict(module_items);
    let mut keys = HashSet::new();
    storage_keys(&module_state, &mut keys);

    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(invalid)?;
        let name = entry.name().to_string();
        let storage = name
            .strip_prefix(record_prefix.as_str())
            .and_then(|rest| rest.strip_prefix("data/"));
        if storage.is_some_and(|key| !keys.contains(key)) {
            continue;
        }

        writer.start_file(name.as_str(), options).map_err(invalid)?;
        if name == pkl_name {
            writer.write_all(&pickle::dumps(&module_state))?;
        } else {
            std::io::copy(&mut entry, &mut writer)?;
        }
    }
    let bytes = writer.finish().map_err(invalid)?.into_inner();
    Ok(Bytes::from(bytes))
}

/// Collect the keys of every tensor storage `value` references.
fn storage_keys<'v>(value: &'v Value, keys: &mut HashSet<&'v str>) {
    match value {
        Value::PersistentId(pid) => {
            if let Value::Tuple(fields) = &**pid {
                if let (Some(Value::Str(kind)), Some(Value::Str(key))) = (fields.first(), fields.get(2)) {
                    if kind == "storage" {
                        keys.insert(key.as_str());
                    }
                }
            }
        }
        Value::Tuple(items) | Value::List(items) => {
            items.iter().for_each(|item| storage_keys(item, keys));
        }
        Value::Dict(items) => {
            for (key, item) in items {
                storage_keys(key, keys);
                storage_keys(item, keys);
            }
        }
        Value::Object {
            callable,
            args,
            items,
            state,
            ..
        } => {
            storage_keys(callable, keys);
            storage_keys(args, keys);
            for (key, item) in items {
                storage_keys(key, keys);
                storage_keys(item, keys);
            }
            if let Some(state) = state {
                storage_keys(state, keys);
            }
        }
        _ => {}
    }
}

/// Converts `HomoNN` components trained with the PyTorch backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NnComponentConverter;

pub(crate) fn build() -> Box<dyn ComponentConverter> {
    Box::new(NnComponentConverter)
}

impl ComponentConverter for NnComponentConverter {
    fn target_modules(&self) -> &'static [&'static str] {
        TARGET_MODULES
    }

    fn convert(&self, record: &ComponentRecord) -> Result<NativeModel> {
        let meta = record.nn_model_meta()?;
        if meta.config_type() != PYTORCH_CONFIG_TYPE {
            return Err(FedServeError::InvalidConfigType(meta.config_type().to_string()));
        }

        let param = record.nn_model_param()?;
        let load = CheckpointLoad::from_api_version(param.api_version);
        let module = TorchModule::from_checkpoint(param.saved_model_bytes.clone(), load)?;
        Ok(NativeModel::PyTorch(module))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::proto::{ComponentField, NnModelMeta, NnModelParam, NnParam};

    /// Zip archive in the layout `torch.save` produces.
    pub(crate) fn zip_checkpoint(data: &Value, storages: &[(&str, &[u8])]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file("archive/data.pkl", options).unwrap();
        writer.write_all(&pickle::dumps(data)).unwrap();
        for (key, bytes) in storages {
            writer.start_file(format!("archive/data/{}", key), options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.start_file("archive/version", options).unwrap();
        writer.write_all(b"3\n").unwrap();
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    /// Plain module checkpoint.
    pub(crate) fn checkpoint_bytes() -> Bytes {
        zip_checkpoint(&Value::Dict(Vec::new()), &[])
    }

    /// `_rebuild_tensor_v2` call over the float storage `key`.
    pub(crate) fn tensor(key: &str, numel: i64) -> Value {
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

    fn key(name: &str) -> Value {
        Value::Str(name.into())
    }

    /// Trainer checkpoint wrapping a one-layer module, with optimizer state.
    pub(crate) fn lightning_checkpoint_bytes() -> Bytes {
        let state_dict = Value::ordered_dict(vec![
            (key("model.0.weight"), tensor("0", 6)),
            (key("model.0.bias"), tensor("1", 2)),
        ]);
        let optimizer = Value::Dict(vec![(
            key("state"),
            Value::Dict(vec![(Value::Int(0), Value::Dict(vec![(key("exp_avg"), tensor("2", 6))]))]),
        )]);
        let root = Value::Dict(vec![
            (key("epoch"), Value::Int(4)),
            (key("global_step"), Value::Int(40)),
            (key("pytorch-lightning_version"), key("1.5.10")),
            (key("state_dict"), state_dict),
            (key("optimizer_states"), Value::List(vec![optimizer])),
        ]);
        zip_checkpoint(&root, &[("0", &[1u8; 24][..]), ("1", &[2u8; 8][..]), ("2", &[3u8; 24][..])])
    }

    /// Legacy stream: magic, protocol version, sys info, object, storage keys.
    fn legacy_checkpoint_bytes() -> Bytes {
        let mut bytes = pickle::dumps(&Value::Long(LEGACY_MAGIC.to_vec()));
        bytes.extend(pickle::dumps(&Value::Int(1001)));
        bytes.extend(pickle::dumps(&Value::Dict(vec![(key("little_endian"), Value::Bool(true))])));
        bytes.extend(pickle::dumps(&Value::Dict(Vec::new())));
        bytes.extend(pickle::dumps(&Value::List(Vec::new())));
        Bytes::from(bytes)
    }

    fn record(config_type: &str, api_version: i32, checkpoint: Bytes) -> ComponentRecord {
        ComponentRecord::new("HomoNN")
            .with(ComponentField::NnModelMeta(NnModelMeta {
                params: Some(NnParam {
                    config_type: config_type.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }))
            .with(ComponentField::NnModelParam(NnModelParam {
                saved_model_bytes: checkpoint,
                api_version,
                ..Default::default()
            }))
    }

    fn convert(record: &ComponentRecord) -> Result<TorchModule> {
        match NnComponentConverter.convert(record)? {
            NativeModel::PyTorch(module) => Ok(module),
            other => panic!("unexpected model: {:?}", other),
        }
    }

    fn entry_names(checkpoint: &[u8]) -> Vec<String> {
        let archive = ZipArchive::new(Cursor::new(checkpoint)).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    fn data_pkl(checkpoint: &[u8]) -> Value {
        let mut archive = ZipArchive::new(Cursor::new(checkpoint)).unwrap();
        let mut data = Vec::new();
        archive.by_name("archive/data.pkl").unwrap().read_to_end(&mut data).unwrap();
        pickle::loads(&data).unwrap()
    }

    #[test]
    fn test_load_path_follows_api_version() {
        let checkpoint = checkpoint_bytes();
        let plain = convert(&record("pytorch", 0, checkpoint.clone())).unwrap();
        assert_eq!(plain.load(), CheckpointLoad::Module);
        assert_eq!(plain.format(), CheckpointFormat::Zip);
        assert!(!plain.is_state_dict());
        assert_eq!(plain.checkpoint(), &checkpoint);

        let lightning = convert(&record("pytorch", 1, lightning_checkpoint_bytes())).unwrap();
        assert_eq!(lightning.load(), CheckpointLoad::FederatedLightning);
        assert!(lightning.is_state_dict());
    }

    #[test]
    fn test_trainer_checkpoint_unwraps_module_state() {
        let source = lightning_checkpoint_bytes();
        let module = convert(&record("pytorch", 1, source.clone())).unwrap();
        assert_ne!(module.checkpoint(), &source);

        let state = data_pkl(module.checkpoint());
        let names: Vec<&str> = state.items().unwrap().iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["0.weight", "0.bias"]);
        assert_eq!(state.get("0.bias"), Some(&tensor("1", 2)));

        let entries = entry_names(module.checkpoint());
        assert!(entries.contains(&"archive/data/0".to_string()));
        assert!(entries.contains(&"archive/data/1".to_string()));
        assert!(!entries.contains(&"archive/data/2".to_string()));
        assert!(entries.contains(&"archive/version".to_string()));
    }

    #[test]
    fn test_load_paths_write_different_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = lightning_checkpoint_bytes();

        let plain = convert(&record("pytorch", 0, source.clone())).unwrap();
        let unwrapped = convert(&record("pytorch", 1, source.clone())).unwrap();
        plain.write_to(&dir.path().join("plain.pt")).unwrap();
        unwrapped.write_to(&dir.path().join("unwrapped.pt")).unwrap();

        let plain = std::fs::read(dir.path().join("plain.pt")).unwrap();
        let unwrapped = std::fs::read(dir.path().join("unwrapped.pt")).unwrap();
        assert_eq!(plain, source.to_vec());
        assert_ne!(plain, unwrapped);
        assert!(data_pkl(&unwrapped).get("epoch").is_none());
    }

    #[test]
    fn test_trainer_checkpoint_without_module_entries() {
        let root = Value::Dict(vec![(
            key("state_dict"),
            Value::ordered_dict(vec![(key("head.weight"), tensor("0", 1))]),
        )]);
        let err = convert(&record("pytorch", 1, zip_checkpoint(&root, &[("0", &[0u8; 4][..])]))).unwrap_err();
        assert!(matches!(&err, FedServeError::InvalidCheckpoint(msg) if msg.contains("model.")));

        let err = convert(&record("pytorch", 1, checkpoint_bytes())).unwrap_err();
        assert!(err.to_string().contains("no state_dict"));
    }

    #[test]
    fn test_legacy_checkpoint() {
        let module = convert(&record("pytorch", 0, legacy_checkpoint_bytes())).unwrap();
        assert_eq!(module.format(), CheckpointFormat::Legacy);
        assert_eq!(module.checkpoint(), &legacy_checkpoint_bytes());

        let err = convert(&record("pytorch", 1, legacy_checkpoint_bytes())).unwrap_err();
        assert!(matches!(&err, FedServeError::InvalidCheckpoint(msg) if msg.contains("legacy")));
    }

    #[test]
    fn test_pickle_without_magic_is_rejected() {
        let err = CheckpointFormat::detect(&pickle::dumps(&Value::Int(3))).unwrap_err();
        assert!(err.to_string().contains("magic number"));
    }

    #[test]
    fn test_rejects_non_pytorch_config() {
        let err = convert(&record("keras", 0, checkpoint_bytes())).unwrap_err();
        assert!(matches!(&err, FedServeError::InvalidConfigType(found) if found == "keras"));
        assert_eq!(err.to_string(), "invalid config type: keras");
    }

    #[test]
    fn test_rejects_garbage_checkpoint() {
        let err = convert(&record("pytorch", 0, Bytes::from_static(b"not a checkpoint"))).unwrap_err();
        assert!(matches!(err, FedServeError::InvalidCheckpoint(_)));
    }
}
