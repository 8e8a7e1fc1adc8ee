//! Parsed, framework-agnostic view of one archive component.

use super::proto::{ComponentField, LrModelMeta, LrModelParam, NnModelMeta, NnModelParam};
use crate::error::{FedServeError, Result};
use std::collections::BTreeMap;

/// A component's declared type plus its decoded payload fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRecord {
    component_type: String,
    fields: BTreeMap<String, ComponentField>,
}

impl ComponentRecord {
    /// Creates an empty record of the given type.
    pub fn new(component_type: impl Into<String>) -> Self {
        Self {
            component_type: component_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field, keyed by its message name.
    pub fn with(mut self, field: ComponentField) -> Self {
        self.insert(field.message_name(), field);
        self
    }

    /// Inserts a field under an explicit logical name.
    pub fn insert(&mut self, name: impl Into<String>, field: ComponentField) {
        self.fields.insert(name.into(), field);
    }

    /// Module/kind tag such as `HomoLR`.
    pub fn component_type(&self) -> &str {
        &self.component_type
    }

    pub fn field(&self, name: &str) -> Option<&ComponentField> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn lr_model_param(&self) -> Result<&LrModelParam> {
        match self.required("LRModelParam")? {
            ComponentField::LrModelParam(p) => Ok(p),
            other => Err(self.mismatch("LRModelParam", other)),
        }
    }

    pub fn lr_model_meta(&self) -> Result<&LrModelMeta> {
        match self.required("LRModelMeta")? {
            ComponentField::LrModelMeta(m) => Ok(m),
            other => Err(self.mismatch("LRModelMeta", other)),
        }
    }

    pub fn nn_model_param(&self) -> Result<&NnModelParam> {
        match self.required("NNModelParam")? {
            ComponentField::NnModelParam(p) => Ok(p),
            other => Err(self.mismatch("NNModelParam", other)),
        }
    }

    pub fn nn_model_meta(&self) -> Result<&NnModelMeta> {
        match self.required("NNModelMeta")? {
            ComponentField::NnModelMeta(m) => Ok(m),
            other => Err(self.mismatch("NNModelMeta", other)),
        }
    }

    fn required(&self, name: &str) -> Result<&ComponentField> {
        self.fields.get(name).ok_or_else(|| FedServeError::MissingField {
            component: self.component_type.clone(),
            field: name.to_string(),
        })
    }

    fn mismatch(&self, expected: &str, found: &ComponentField) -> FedServeError {
        FedServeError::Decode(format!(
            "field {} of component {} holds a {} message",
            expected,
            self.component_type,
            found.message_name()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let record = ComponentRecord::new("HomoLR").with(ComponentField::LrModelParam(LrModelParam {
            intercept: 0.5,
            ..Default::default()
        }));
        assert_eq!(record.component_type(), "HomoLR");
        assert_eq!(record.lr_model_param().unwrap().intercept, 0.5);
        assert!(matches!(
            record.nn_model_meta(),
            Err(FedServeError::MissingField { field, .. }) if field == "NNModelMeta"
        ));
    }

    #[test]
    fn test_mismatched_field_type() {
        let mut record = ComponentRecord::new("HomoNN");
        record.insert("NNModelParam", ComponentField::LrModelMeta(LrModelMeta::default()));
        assert!(matches!(record.nn_model_param(), Err(FedServeError::Decode(_))));
    }
}
