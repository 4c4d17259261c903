//! `${{ ... }}` expression expansion for step commands and action inputs.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

fn expression_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("valid interpolation regex"))
}

/// Context for `${{ ... }}` interpolation inside a job.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Pipeline, job and step environment
    pub env: HashMap<String, String>,
    /// Matrix values for the current job instance
    pub matrix: HashMap<String, String>,
    /// `job.id` and `job.name`
    pub job: HashMap<String, String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ matrix.key }}` - matrix value
    /// - `${{ env.VAR }}` - job environment, falling back to the process environment
    /// - `${{ job.id }}` / `${{ job.name }}`
    ///
    /// Unknown expressions resolve to an empty string.
    pub fn interpolate(&self, input: &str) -> String {
        if !input.contains("${{") {
            return input.to_string();
        }
        expression_re()
            .replace_all(input, |caps: &Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve(expr)
            })
            .into_owned()
    }

    fn resolve(&self, expr: &str) -> String {
        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }
        if let Some(var) = expr.strip_prefix("env.") {
            return self
                .env
                .get(var)
                .cloned()
                .or_else(|| std::env::var(var).ok())
                .unwrap_or_default();
        }
        if let Some(key) = expr.strip_prefix("job.") {
            return self.job.get(key).cloned().unwrap_or_default();
        }
        String::new()
    }
}
