//! Computed attributes.
//!
//! A computed attribute is either a formula over other attributes or a
//! named callback registered with the engine. Lazy attributes are evaluated
//! on every read; materialized (indexed) ones are evaluated at write time and
//! stored with the record.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use hdb_catalog::{ComputedAttribute, ComputedMode, ComputedSource, TableDef};
use hdb_types::Record;
use serde_json::Value;
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::expr::{Expr, RecordScope};
use crate::sql::parse_expression;

/// A computed attribute callback.
pub type ComputedFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Callbacks and parsed formulas for computed attributes.
#[derive(Default)]
pub struct ComputedRegistry {
    callbacks: RwLock<HashMap<String, ComputedFn>>,
    formulas: RwLock<HashMap<String, Arc<Expr>>>,
}

impl fmt::Debug for ComputedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .callbacks
            .read()
            .map(|callbacks| callbacks.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ComputedRegistry")
            .field("callbacks", &names)
            .finish_non_exhaustive()
    }
}

impl ComputedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the callback `name`.
    pub fn register(&self, name: impl Into<String>, callback: ComputedFn) {
        let name = name.into();
        debug!(callback = %name, "registering computed attribute callback");
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.insert(name, callback);
        }
    }

    pub fn has_callback(&self, name: &str) -> bool {
        self.callbacks
            .read()
            .is_ok_and(|callbacks| callbacks.contains_key(name))
    }

    /// Checks that a declared source can be evaluated.
    pub fn validate(&self, source: &ComputedSource) -> Result<()> {
        match source {
            ComputedSource::Formula(formula) => self.formula(formula).map(|_| ()),
            ComputedSource::Callback(name) if self.has_callback(name) => Ok(()),
            ComputedSource::Callback(name) => Err(QueryError::UnknownCallback(name.clone())),
        }
    }

    fn formula(&self, formula: &str) -> Result<Arc<Expr>> {
        if let Some(expr) = self
            .formulas
            .read()
            .ok()
            .and_then(|formulas| formulas.get(formula).cloned())
        {
            return Ok(expr);
        }
        let expr = Arc::new(parse_expression(formula)?);
        if expr.contains_aggregate() {
            return Err(QueryError::InvalidArgument(format!(
                "computed attribute formula '{formula}' cannot use aggregate functions"
            )));
        }
        if let Ok(mut formulas) = self.formulas.write() {
            formulas.insert(formula.to_string(), Arc::clone(&expr));
        }
        Ok(expr)
    }

    /// Evaluates one computed attribute against `record`.
    pub fn evaluate(&self, attribute: &ComputedAttribute, record: &Record) -> Result<Value> {
        match &attribute.source {
            ComputedSource::Formula(formula) => {
                self.formula(formula)?.evaluate(&RecordScope::new(record))
            }
            ComputedSource::Callback(name) => {
                let callback = self
                    .callbacks
                    .read()
                    .ok()
                    .and_then(|callbacks| callbacks.get(name).cloned())
                    .ok_or_else(|| QueryError::UnknownCallback(name.clone()))?;
                Ok(callback(record))
            }
        }
    }

    /// Sets every computed attribute of `table` with the given mode on
    /// `record`. A null result removes the attribute.
    pub fn apply(&self, table: &TableDef, record: &mut Record, mode: ComputedMode) -> Result<()> {
        for attribute in table.computed_attributes() {
            if attribute.mode() != mode {
                continue;
            }
            let value = self.evaluate(&attribute, record)?;
            if value.is_null() {
                record.remove(&attribute.name);
            } else {
                record.insert(attribute.name, value);
            }
        }
        Ok(())
    }
}
