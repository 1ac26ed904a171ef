//! Schema definitions for sandtest spec files.
//!
//! A spec file is a YAML list of test specs. Each spec names a test case,
//! optional setup/cleanup shell commands, the assertion steps, and an
//! optional `foreach` list of substitution maps that turns the spec into a
//! template producing one concrete test case per map.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single test spec document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Spec {
    /// Test display name.
    pub test: String,

    /// Shell command lines run before the steps. A nonzero exit aborts the
    /// test case before any step runs.
    #[serde(default)]
    pub setup: Vec<String>,

    /// Shell command lines run after the steps, once setup has completed.
    #[serde(default)]
    pub cleanup: Vec<String>,

    /// The assertion steps, run in order.
    pub steps: Vec<Step>,

    /// Substitution maps. When present, every `{key}` occurrence in the
    /// spec's string fields is replaced per map, yielding one concrete test
    /// case per entry.
    #[serde(default)]
    pub foreach: Option<Vec<HashMap<String, String>>>,
}

/// A single step: a command line plus the expected outcome.
///
/// The variant is determined by which expectation field is present: `out`
/// makes a pass-step, `err` makes a fail-step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Step {
    /// Asserts a stdout pattern with an implied successful exit.
    Pass(PassStep),
    /// Asserts a stderr pattern and an expected exit code.
    Fail(FailStep),
}

/// A step expecting stdout to match a wildcard pattern.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PassStep {
    /// Command line sent to the sandbox shell.
    #[serde(rename = "in")]
    pub input: String,

    /// Expected stdout, as a wildcard pattern.
    pub out: String,
}

/// A step expecting stderr to match a wildcard pattern and a specific exit
/// code.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FailStep {
    /// Command line sent to the sandbox shell.
    #[serde(rename = "in")]
    pub input: String,

    /// Expected stderr, as a wildcard pattern.
    pub err: String,

    /// Expected exit code. Defaults to 0: a fail-step may assert stderr
    /// text while still expecting a clean exit.
    #[serde(default)]
    pub exit: i32,
}

impl Step {
    /// The command line this step sends.
    pub fn input(&self) -> &str {
        match self {
            Step::Pass(s) => &s.input,
            Step::Fail(s) => &s.input,
        }
    }
}

impl Spec {
    /// Expand this spec into its concrete test cases.
    ///
    /// Without `foreach` the spec itself is the single case. With `foreach`,
    /// each substitution map produces one case by replacing `{key}` tokens
    /// in every string field: the test name, setup and cleanup lines, and
    /// each step's `in`/`out`/`err`. Expansion walks the structure directly;
    /// the spec is never re-serialized.
    pub fn concrete_cases(&self) -> Vec<Spec> {
        let Some(maps) = &self.foreach else {
            return vec![self.clone()];
        };
        maps.iter().map(|vars| self.substitute(vars)).collect()
    }

    fn substitute(&self, vars: &HashMap<String, String>) -> Spec {
        let sub = |s: &str| apply_vars(s, vars);
        Spec {
            test: sub(&self.test),
            setup: self.setup.iter().map(|s| sub(s)).collect(),
            cleanup: self.cleanup.iter().map(|s| sub(s)).collect(),
            steps: self
                .steps
                .iter()
                .map(|step| match step {
                    Step::Pass(p) => Step::Pass(PassStep {
                        input: sub(&p.input),
                        out: sub(&p.out),
                    }),
                    Step::Fail(f) => Step::Fail(FailStep {
                        input: sub(&f.input),
                        err: sub(&f.err),
                        exit: f.exit,
                    }),
                })
                .collect(),
            foreach: None,
        }
    }
}

/// Replace every `{key}` occurrence with its value.
fn apply_vars(s: &str, vars: &HashMap<String, String>) -> String {
    let mut result = s.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{key}}}"), value);
    }
    result
}

/// Generate the JSON Schema for a spec file (a list of specs).
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Vec<Spec>)
}
