//! Protobuf messages stored in archive payload files, and the registry that
//! maps a logical field name to its decoder.

use crate::error::{FedServeError, Result};
use prost::Message;
use std::collections::HashMap;

/// Trained parameters of a logistic-regression component.
#[derive(Clone, PartialEq, Message)]
pub struct LrModelParam {
    #[prost(int32, tag = "1")]
    pub iters: i32,
    #[prost(double, repeated, tag = "2")]
    pub loss_history: Vec<f64>,
    #[prost(bool, tag = "3")]
    pub is_converged: bool,
    /// Feature name to weight.
    #[prost(map = "string, double", tag = "4")]
    pub weight: HashMap<String, f64>,
    #[prost(double, tag = "5")]
    pub intercept: f64,
    /// Feature names in positional order.
    #[prost(string, repeated, tag = "6")]
    pub header: Vec<String>,
    #[prost(bool, tag = "8")]
    pub need_one_vs_rest: bool,
}

/// Training settings of a logistic-regression component.
#[derive(Clone, PartialEq, Message)]
pub struct LrModelMeta {
    #[prost(string, tag = "1")]
    pub penalty: String,
    #[prost(double, tag = "2")]
    pub tol: f64,
    #[prost(double, tag = "3")]
    pub alpha: f64,
    #[prost(string, tag = "4")]
    pub optimizer: String,
    #[prost(int32, tag = "5")]
    pub batch_size: i32,
    #[prost(double, tag = "6")]
    pub learning_rate: f64,
    #[prost(int32, tag = "7")]
    pub max_iter: i32,
    #[prost(string, tag = "8")]
    pub early_stop: String,
    #[prost(bool, tag = "9")]
    pub fit_intercept: bool,
}

/// Trained state of a neural-network component.
#[derive(Clone, PartialEq, Message)]
pub struct NnModelParam {
    #[prost(int32, tag = "1")]
    pub aggregate_iter: i32,
    /// Serialized framework checkpoint.
    #[prost(bytes = "bytes", tag = "2")]
    pub saved_model_bytes: bytes::Bytes,
    #[prost(double, repeated, tag = "3")]
    pub loss_history: Vec<f64>,
    #[prost(bool, tag = "4")]
    pub is_converged: bool,
    #[prost(string, repeated, tag = "5")]
    pub header: Vec<String>,
    /// Non-zero when the checkpoint was written by the federated trainer.
    #[prost(int32, tag = "6")]
    pub api_version: i32,
}

/// Configuration of a neural-network component.
#[derive(Clone, PartialEq, Message)]
pub struct NnModelMeta {
    #[prost(string, tag = "1")]
    pub aggregate_type: String,
    #[prost(message, optional, tag = "2")]
    pub params: Option<NnParam>,
}

impl NnModelMeta {
    /// Declared sub-framework, empty when the meta carries no params.
    pub fn config_type(&self) -> &str {
        self.params
            .as_ref()
            .map(|p| p.config_type.as_str())
            .unwrap_or_default()
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct NnParam {
    #[prost(int32, tag = "1")]
    pub num_party: i32,
    #[prost(string, tag = "2")]
    pub config_type: String,
    #[prost(string, tag = "3")]
    pub optimizer: String,
    #[prost(string, tag = "4")]
    pub loss: String,
    #[prost(string, repeated, tag = "5")]
    pub metrics: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    pub nn_define: Vec<String>,
}

/// A decoded payload, tagged by message type.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentField {
    LrModelParam(LrModelParam),
    LrModelMeta(LrModelMeta),
    NnModelParam(NnModelParam),
    NnModelMeta(NnModelMeta),
}

impl ComponentField {
    /// Message name as recorded in the archive manifest.
    pub fn message_name(&self) -> &'static str {
        match self {
            ComponentField::LrModelParam(_) => "LRModelParam",
            ComponentField::LrModelMeta(_) => "LRModelMeta",
            ComponentField::NnModelParam(_) => "NNModelParam",
            ComponentField::NnModelMeta(_) => "NNModelMeta",
        }
    }

    /// Encode back to protobuf bytes.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        match self {
            ComponentField::LrModelParam(m) => m.encode_to_vec(),
            ComponentField::LrModelMeta(m) => m.encode_to_vec(),
            ComponentField::NnModelParam(m) => m.encode_to_vec(),
            ComponentField::NnModelMeta(m) => m.encode_to_vec(),
        }
    }
}

type Decoder = fn(&[u8]) -> Result<ComponentField>;

fn decode_lr_param(buf: &[u8]) -> Result<ComponentField> {
    Ok(ComponentField::LrModelParam(LrModelParam::decode(buf)?))
}

fn decode_lr_meta(buf: &[u8]) -> Result<ComponentField> {
    Ok(ComponentField::LrModelMeta(LrModelMeta::decode(buf)?))
}

fn decode_nn_param(buf: &[u8]) -> Result<ComponentField> {
    Ok(ComponentField::NnModelParam(NnModelParam::decode(buf)?))
}

fn decode_nn_meta(buf: &[u8]) -> Result<ComponentField> {
    Ok(ComponentField::NnModelMeta(NnModelMeta::decode(buf)?))
}

/// Known message types, keyed by the name used in `model_proto` entries.
const MESSAGE_TYPES: &[(&str, Decoder)] = &[
    ("LRModelParam", decode_lr_param),
    ("LRModelMeta", decode_lr_meta),
    ("NNModelParam", decode_nn_param),
    ("NNModelMeta", decode_nn_meta),
];

/// Names of every decodable message type.
pub fn message_types() -> impl Iterator<Item = &'static str> {
    MESSAGE_TYPES.iter().map(|(name, _)| *name)
}

/// Decode `buf` as the message type called `name`.
pub fn decode_message(name: &str, buf: &[u8]) -> Result<ComponentField> {
    let decode = MESSAGE_TYPES
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, decode)| *decode)
        .ok_or_else(|| FedServeError::ProtoTypeNotFound(name.to_string()))?;
    decode(buf).map_err(|e| match e {
        FedServeError::Decode(msg) => FedServeError::Decode(format!("{}: {}", name, msg)),
        other => other,
    })
}
