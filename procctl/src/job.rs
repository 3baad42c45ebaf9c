// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Jobs are plain descriptors: the name of a registered function plus its
//! JSON arguments. Only the descriptor crosses the process boundary; the
//! worker process looks the function up in its own [`JobRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Signature of a job function. Receives the positional arguments.
pub type JobFn = fn(&[Value]) -> anyhow::Result<Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum JobArgs {
    None,
    Single(Value),
    Spread(Vec<Value>),
}

impl JobArgs {
    /// Argument shape of a one-off process: no arguments for a function
    /// without parameters, arrays spread over several parameters, anything
    /// else passed as it is.
    pub fn for_target(target: &JobTarget, value: Value) -> Self {
        match (target.arity, value) {
            (0, _) => JobArgs::None,
            (1, value) => JobArgs::Single(value),
            (_, Value::Array(values)) => JobArgs::Spread(values),
            (_, value) => JobArgs::Single(value),
        }
    }

    pub fn into_vec(self) -> Vec<Value> {
        match self {
            JobArgs::None => Vec::new(),
            JobArgs::Single(value) => vec![value],
            JobArgs::Spread(values) => values,
        }
    }
}

/// The function a controller is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTarget {
    pub function: String,
    /// Number of positional parameters the function takes.
    pub arity: usize,
}

impl JobTarget {
    pub fn new(function: impl Into<String>, arity: usize) -> Self {
        Self {
            function: function.into(),
            arity,
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.function, self.arity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub function: String,
    pub args: JobArgs,
}

/// How the entries of a submitted batch are turned into calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// The target takes no arguments; every entry becomes one plain call.
    Apply,
    /// Every entry is the single argument of one call.
    Map,
    /// Every entry is spread over the parameters of one call.
    StarMap,
}

impl DispatchStrategy {
    pub fn choose(target: &JobTarget, jobs: &[Value]) -> Self {
        if target.arity == 0 {
            DispatchStrategy::Apply
        } else if jobs.iter().any(Value::is_array) {
            DispatchStrategy::StarMap
        } else {
            DispatchStrategy::Map
        }
    }

    pub fn job_args(self, value: Value) -> JobArgs {
        match (self, value) {
            (DispatchStrategy::Apply, _) => JobArgs::None,
            (DispatchStrategy::Map, value) => JobArgs::Single(value),
            (DispatchStrategy::StarMap, Value::Array(values)) => JobArgs::Spread(values),
            (DispatchStrategy::StarMap, value) => JobArgs::Spread(vec![value]),
        }
    }

    pub fn jobs(self, target: &JobTarget, values: Vec<Value>) -> Vec<JobSpec> {
        values
            .into_iter()
            .map(|value| JobSpec {
                function: target.function.clone(),
                args: self.job_args(value),
            })
            .collect()
    }
}

/// What became of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "kebab-case")]
pub enum JobOutcome {
    Ok(Value),
    /// The job returned an error or panicked. Holds the flattened cause.
    Failed(String),
}

impl JobOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, JobOutcome::Ok(_))
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self {
            JobOutcome::Ok(value) => Ok(value),
            JobOutcome::Failed(cause) => Err(cause),
        }
    }
}

/// One retrieved result. `origin` is `Pool Batch ID: {id}` for pool
/// results and the process name for one-off processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// `None` marks a pool job that failed.
    pub payload: Option<Value>,
    pub origin: String,
}

impl ResultEntry {
    pub fn new(payload: Option<Value>, origin: impl Into<String>) -> Self {
        Self {
            payload,
            origin: origin.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RegisteredJob {
    arity: usize,
    func: JobFn,
}

/// Name to function table. Controller and worker processes must build the
/// same registry, usually by calling one shared constructor function.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, arity: usize, func: JobFn) -> &mut Self {
        self.jobs.insert(name.into(), RegisteredJob { arity, func });
        self
    }

    pub fn with(mut self, name: impl Into<String>, arity: usize, func: JobFn) -> Self {
        self.register(name, arity, func);
        self
    }

    pub fn target(&self, name: &str) -> Result<JobTarget, Error> {
        self.jobs
            .get(name)
            .map(|job| JobTarget::new(name, job.arity))
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    pub fn call(&self, spec: &JobSpec) -> anyhow::Result<Value> {
        let Some(job) = self.jobs.get(&spec.function) else {
            return Err(Error::UnknownFunction(spec.function.clone()).into());
        };
        let args = spec.args.clone().into_vec();
        if args.len() != job.arity {
            bail!(
                "{} takes {} argument(s) but {} were given",
                spec.function,
                job.arity,
                args.len()
            );
        }
        (job.func)(&args)
    }

    /// Runs a job and turns errors and panics into [`JobOutcome::Failed`].
    pub fn run(&self, spec: &JobSpec) -> JobOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.call(spec))) {
            Ok(Ok(value)) => JobOutcome::Ok(value),
            Ok(Err(e)) => JobOutcome::Failed(format!("{e:#}")),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                JobOutcome::Failed(format!("{} panicked: {msg}", spec.function))
            }
        }
    }
}
