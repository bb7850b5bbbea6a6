//! Variable interpolation for command templates.
//!
//! Supports variables like:
//! - `${worker}` - Worker name
//! - `${vm_host}` - Host owning the worker's VM
//!
//! Unknown variables are left in place so validation can report them.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)\}").unwrap());

/// Variables available to a command template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for commands run on behalf of a worker.
    pub fn for_worker(name: &str, vm_host: Option<&str>) -> Self {
        let mut ctx = Self::new().with("worker", name);
        if let Some(host) = vm_host {
            ctx = ctx.with("vm_host", host);
        }
        ctx
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let name = &caps[1];
                self.resolve(name)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| format!("${{{}}}", name))
            })
            .to_string()
    }

    /// Interpolate a command line and split it into program and arguments.
    ///
    /// Splitting happens before interpolation so values containing spaces
    /// stay a single argument.
    pub fn command_line(&self, template: &str) -> Vec<String> {
        template
            .split_whitespace()
            .map(|word| self.interpolate(word))
            .collect()
    }
}

/// Names of all variables referenced by a template.
pub fn referenced_variables(template: &str) -> Vec<String> {
    VAR_REGEX
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}
