//! fedserve - Convert federated-learning models into standard ML framework
//! models and serve them on KServe.
//!
//! A model trained with FATE is stored as a directory archive: a
//! `define_meta.yaml` manifest naming each component and its module, plus
//! protobuf payloads per component. fedserve reads the main component,
//! converts it into a framework-native model and stands it up as an
//! InferenceService.
//!
//! # Features
//!
//! - **Archive reader**: manifest parsing and typed protobuf payloads.
//! - **Converter registry**: `HomoLR` to scikit-learn, `HomoNN` to PyTorch.
//! - **Model storage**: local directories or S3-compatible object stores.
//! - **Serving**: KServe/KFServing InferenceServices, with TorchServe packaging.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         fedserve                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Sources: local archive | FATE Flow export | in-memory record│
//! ├─────────────────────────────────────────────────────────────┤
//! │  Model: manifest -> main component -> preferred framework   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Convert: registry lookup -> native model -> model storage  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Deploy: predictor spec | S3 credentials | InferenceService │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use fedserve::config::EngineConfig;
//! use fedserve::convert::ConverterOptions;
//! use fedserve::deploy::DeployerOptions;
//! use fedserve::model::{self, FateModelOptions};
//! use fedserve::Engine;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fedserve::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!
//!     let options = FateModelOptions {
//!         model_path: Some("/data/fate/model".into()),
//!         ..Default::default()
//!     };
//!     let trained = model::get_trained_model("fate", options, &config).await?;
//!
//!     let mut engine = Engine::new(
//!         "credit-lr",
//!         None,
//!         Arc::from(trained),
//!         ConverterOptions::default(),
//!         DeployerOptions::default(),
//!         config,
//!     );
//!     engine.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod observability;

pub mod archive;
pub mod convert;
pub mod deploy;
pub mod engine;
pub mod fate;
pub mod model;
pub mod storage;

pub use config::EngineConfig;
pub use convert::{ConvertedModel, Converter, Framework, NativeModel};
pub use deploy::{Deployer, InferenceService, ServiceStatus};
pub use engine::Engine;
pub use error::{FedServeError, Result};
pub use model::{FateModel, TrainedModel};
