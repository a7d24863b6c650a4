//! Metadata filters applied alongside vector search.
//!
//! A [`DocumentMetadataFilter`] is backend-neutral; each adapter translates
//! it into its native filter syntax (a term/range query, a boolean filter
//! expression, a `where` clause, ...).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// Comparison applied between a metadata field and a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
}

impl FilterOperator {
    /// Whether the operator expects a list value.
    pub fn takes_list(&self) -> bool {
        matches!(self, FilterOperator::In | FilterOperator::NotIn)
    }

    /// Whether the operator is an ordering comparison.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            FilterOperator::Gt | FilterOperator::Gte | FilterOperator::Lt | FilterOperator::Lte
        )
    }
}

/// A single `field <operator> value` condition on chunk metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadataFilter {
    pub field_name: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl DocumentMetadataFilter {
    /// Create a validated filter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] if the field name is empty, a
    /// list operator is given a non-list value, or a range operator is given
    /// something other than a number or string.
    pub fn new(
        field_name: impl Into<String>,
        operator: FilterOperator,
        value: Value,
    ) -> Result<Self> {
        let filter = Self { field_name: field_name.into(), operator, value };
        filter.validate()?;
        Ok(filter)
    }

    /// Shorthand for an equality filter.
    pub fn eq(field_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { field_name: field_name.into(), operator: FilterOperator::Eq, value: value.into() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.field_name.trim().is_empty() {
            return Err(StoreError::InvalidInput("filter field name must not be empty".into()));
        }
        if self.operator.takes_list() && !self.value.is_array() {
            return Err(StoreError::InvalidInput(format!(
                "filter on '{}' with operator {:?} requires a list value",
                self.field_name, self.operator
            )));
        }
        if self.operator.is_range() && !(self.value.is_number() || self.value.is_string()) {
            return Err(StoreError::InvalidInput(format!(
                "range filter on '{}' requires a number or string value",
                self.field_name
            )));
        }
        Ok(())
    }

    /// The filter value as a list, for `In`/`NotIn`.
    pub fn values(&self) -> &[Value] {
        match &self.value {
            Value::Array(items) => items,
            other => std::slice::from_ref(other),
        }
    }

    /// Evaluate the filter against a flat metadata object.
    ///
    /// A missing field only satisfies `Ne` and `NotIn`.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        let Some(actual) = fields.get(&self.field_name) else {
            return matches!(self.operator, FilterOperator::Ne | FilterOperator::NotIn);
        };
        match self.operator {
            FilterOperator::Eq => values_equal(actual, &self.value),
            FilterOperator::Ne => !values_equal(actual, &self.value),
            FilterOperator::In => self.values().iter().any(|v| values_equal(actual, v)),
            FilterOperator::NotIn => !self.values().iter().any(|v| values_equal(actual, v)),
            FilterOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Gte => {
                matches!(compare(actual, &self.value), Some(Ordering::Greater | Ordering::Equal))
            }
            FilterOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Lte => {
                matches!(compare(actual, &self.value), Some(Ordering::Less | Ordering::Equal))
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
