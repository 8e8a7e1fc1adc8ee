//! Linear-model conversion to a scikit-learn style logistic regression.

use super::{ComponentConverter, NativeModel};
use crate::archive::ComponentRecord;
use crate::error::{FedServeError, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Component types handled by [`LrComponentConverter`].
pub const TARGET_MODULES: &[&str] = &["HomoLR"];

/// Binary logistic regression in scikit-learn's attribute layout.
///
/// `coef` has shape `(1, n_features)`, `intercept` has one element and
/// `classes` is always `[0, 1]`: the federated component only trains
/// binary classifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub coef: Array2<f64>,
    pub intercept: Array1<f64>,
    pub classes: Array1<f64>,
    /// Feature names in column order.
    pub feature_names: Vec<String>,
}

impl LogisticRegression {
    pub fn n_features(&self) -> usize {
        self.coef.ncols()
    }

    /// Signed distance of each sample to the decision boundary.
    pub fn decision_function(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        if x.ncols() != self.n_features() {
            return Err(FedServeError::InvalidArgument(format!(
                "expected {} features, got {}",
                self.n_features(),
                x.ncols()
            )));
        }
        let scores = x.dot(&self.coef.t()).index_axis_move(Axis(1), 0);
        Ok(scores + self.intercept[0])
    }

    /// Class probabilities, one row per sample and one column per class.
    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let positive = self
            .decision_function(x)?
            .mapv(|z| 1.0 / (1.0 + (-z).exp()));
        let mut proba = Array2::zeros((positive.len(), 2));
        proba.column_mut(0).assign(&positive.mapv(|p| 1.0 - p));
        proba.column_mut(1).assign(&positive);
        Ok(proba)
    }

    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        let scores = self.decision_function(x)?;
        Ok(scores.mapv(|z| if z > 0.0 { self.classes[1] } else { self.classes[0] }))
    }
}

/// Converts `HomoLR` components.
#[derive(Debug, Clone, Copy, Default)]
pub struct LrComponentConverter;

pub(crate) fn build() -> Box<dyn ComponentConverter> {
    Box::new(LrComponentConverter)
}

impl ComponentConverter for LrComponentConverter {
    fn target_modules(&self) -> &'static [&'static str] {
        TARGET_MODULES
    }

    fn convert(&self, record: &ComponentRecord) -> Result<NativeModel> {
        let param = record.lr_model_param()?;

        let coef = param
            .header
            .iter()
            .map(|feature| {
                param
                    .weight
                    .get(feature)
                    .copied()
                    .ok_or_else(|| FedServeError::MissingFeatureWeight(feature.clone()))
            })
            .collect::<Result<Vec<f64>>>()?;

        Ok(NativeModel::Sklearn(LogisticRegression {
            coef: Array1::from(coef).insert_axis(Axis(0)),
            intercept: Array1::from(vec![param.intercept]),
            classes: Array1::from(vec![0.0, 1.0]),
            feature_names: param.header.clone(),
        }))
    }
}
