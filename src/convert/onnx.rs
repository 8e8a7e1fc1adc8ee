//! ONNX export of linear models.
//!
//! Only the subset of `onnx.proto` needed to describe a single
//! `ai.onnx.ml.LinearClassifier` graph is declared here. The tags match the
//! upstream schema, so the output loads in any ONNX runtime.

use super::LogisticRegression;
use prost::Message;

pub const IR_VERSION: i64 = 8;
pub const ML_DOMAIN: &str = "ai.onnx.ml";
pub const INPUT_NAME: &str = "float_input";
pub const LABEL_OUTPUT: &str = "label";
pub const PROBABILITY_OUTPUT: &str = "probabilities";

/// `TensorProto.DataType` values.
pub mod data_type {
    pub const FLOAT: i32 = 1;
    pub const INT64: i32 = 7;
}

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(string, tag = "3")]
    pub producer_version: String,
    #[prost(string, tag = "4")]
    pub domain: String,
    #[prost(int64, tag = "5")]
    pub model_version: i64,
    #[prost(string, tag = "6")]
    pub doc_string: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    pub domain: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "10")]
    pub doc_string: String,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
    #[prost(string, tag = "7")]
    pub domain: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "3")]
    pub i: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub s: Vec<u8>,
    #[prost(float, repeated, tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, tag = "8")]
    pub ints: Vec<i64>,
    #[prost(enumeration = "AttributeType", tag = "20")]
    pub r#type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AttributeType {
    Undefined = 0,
    Float = 1,
    Int = 2,
    String = 3,
    Floats = 6,
    Ints = 7,
}

impl AttributeProto {
    fn floats(name: &str, values: Vec<f32>) -> Self {
        Self {
            name: name.to_string(),
            floats: values,
            r#type: AttributeType::Floats as i32,
            ..Default::default()
        }
    }

    fn ints(name: &str, values: Vec<i64>) -> Self {
        Self {
            name: name.to_string(),
            ints: values,
            r#type: AttributeType::Ints as i32,
            ..Default::default()
        }
    }

    fn string(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            s: value.as_bytes().to_vec(),
            r#type: AttributeType::String as i32,
            ..Default::default()
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

/// `TypeProto` restricted to its tensor member.
#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(message, optional, tag = "1")]
    pub tensor_type: Option<TensorTypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorTypeProto {
    #[prost(int32, tag = "1")]
    pub elem_type: i32,
    #[prost(message, optional, tag = "2")]
    pub shape: Option<TensorShapeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<Dimension>,
}

/// One dimension: a fixed size or a symbolic name.
#[derive(Clone, PartialEq, Message)]
pub struct Dimension {
    #[prost(int64, tag = "1")]
    pub dim_value: i64,
    #[prost(string, tag = "2")]
    pub dim_param: String,
}

impl Dimension {
    fn fixed(size: usize) -> Self {
        Self {
            dim_value: size as i64,
            ..Default::default()
        }
    }

    fn batch() -> Self {
        Self {
            dim_param: "N".to_string(),
            ..Default::default()
        }
    }
}

fn tensor(name: &str, elem_type: i32, dim: Vec<Dimension>) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            tensor_type: Some(TensorTypeProto {
                elem_type,
                shape: Some(TensorShapeProto { dim }),
            }),
        }),
    }
}

impl ModelProto {
    /// The first attribute called `name` on the graph's first node.
    pub fn attribute(&self, name: &str) -> Option<&AttributeProto> {
        self.graph
            .as_ref()?
            .node
            .first()?
            .attribute
            .iter()
            .find(|a| a.name == name)
    }
}

/// Describe `lr` as a `LinearClassifier` graph.
///
/// The positive-class row is mirrored into a negative-class row so a
/// logistic post transform yields `[1 - p, p]` and the argmax label matches
/// [`LogisticRegression::predict`].
pub fn linear_classifier(lr: &LogisticRegression) -> ModelProto {
    let weights: Vec<f32> = lr.coef.row(0).iter().map(|w| *w as f32).collect();
    let intercept = lr.intercept[0] as f32;

    let coefficients = weights
        .iter()
        .map(|w| -w)
        .chain(weights.iter().copied())
        .collect();
    let class_labels = lr.classes.iter().map(|c| *c as i64).collect();

    let node = NodeProto {
        input: vec![INPUT_NAME.to_string()],
        output: vec![LABEL_OUTPUT.to_string(), PROBABILITY_OUTPUT.to_string()],
        name: "LinearClassifier".to_string(),
        op_type: "LinearClassifier".to_string(),
        attribute: vec![
            AttributeProto::floats("coefficients", coefficients),
            AttributeProto::floats("intercepts", vec![-intercept, intercept]),
            AttributeProto::ints("classlabels_ints", class_labels),
            AttributeProto::string("post_transform", "LOGISTIC"),
        ],
        domain: ML_DOMAIN.to_string(),
    };

    ModelProto {
        ir_version: IR_VERSION,
        producer_name: "fedserve".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        doc_string: lr.feature_names.join(","),
        graph: Some(GraphProto {
            node: vec![node],
            name: "logistic_regression".to_string(),
            input: vec![tensor(
                INPUT_NAME,
                data_type::FLOAT,
                vec![Dimension::batch(), Dimension::fixed(lr.n_features())],
            )],
            output: vec![
                tensor(LABEL_OUTPUT, data_type::INT64, vec![Dimension::batch()]),
                tensor(
                    PROBABILITY_OUTPUT,
                    data_type::FLOAT,
                    vec![Dimension::batch(), Dimension::fixed(lr.classes.len())],
                ),
            ],
            ..Default::default()
        }),
        opset_import: vec![
            OperatorSetIdProto {
                domain: String::new(),
                version: 15,
            },
            OperatorSetIdProto {
                domain: ML_DOMAIN.to_string(),
                version: 1,
            },
        ],
        ..Default::default()
    }
}

/// Serialized ONNX model bytes for `lr`.
pub fn encode(lr: &LogisticRegression) -> Vec<u8> {
    linear_classifier(lr).encode_to_vec()
}
