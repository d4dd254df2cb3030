//! Command template rendering.
//!
//! Stage commands, predicate paths and cluster queries are minijinja templates
//! (`mris_calc -o {{ out_stem }}B0Mask.nii ...`). Undefined variables are an
//! error rather than an empty string, so a typo in a definition halts the
//! pipeline before anything runs.

use std::collections::BTreeMap;

use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;

use crate::error::FatalError;

/// Variables visible to a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<String, Value>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from string variables (pipeline `vars`).
    pub fn from_strings<'a, I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut out = Self::new();
        for (key, value) in vars {
            out.set(key, value.as_str());
        }
        out
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values
            .insert(key.to_string(), Value::from(value.into()));
        self
    }

    /// Insert any serializable value (e.g. a map of located inputs).
    pub fn set_value<T: Serialize>(&mut self, key: &str, value: &T) -> &mut Self {
        self.values
            .insert(key.to_string(), Value::from_serialize(value));
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }
}

/// Render `template` against `vars` with strict undefined handling.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, FatalError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(template, &vars.values).map_err(|err| {
        FatalError::configuration(format!("render template '{template}': {err}"))
    })
}
