//! Pluggable task execution.

use async_trait::async_trait;
use rmpv::Value;

use crate::error::WorkerError;

/// Outcome of executing one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task produced a value.
    Finished(Value),
    /// The task raised.
    Erred {
        /// Exception text.
        exception: String,
        /// Traceback text.
        traceback: String,
    },
}

impl TaskOutcome {
    /// Build an erred outcome from a worker error.
    pub fn from_error(err: &WorkerError, traceback: impl Into<String>) -> Self {
        Self::Erred { exception: err.to_string(), traceback: traceback.into() }
    }

    /// Whether the task produced a value.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// Runs deserialized task payloads.
///
/// `func` is the opaque function payload from the scheduler; `args` and
/// `kwargs` have already had dependency placeholders substituted. The worker
/// core never inspects the produced value.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Execute one task.
    async fn execute(&self, func: &[u8], args: Value, kwargs: Value) -> TaskOutcome;
}

/// A minimal executor understanding a handful of built-in operations.
///
/// The function payload is a UTF-8 operation name and arguments are an array
/// of MessagePack scalars. Used by the integration tests and demos; real
/// deployments plug in their own [`Executor`].
#[derive(Debug, Default)]
pub struct ArithmeticExecutor;

#[async_trait]
impl Executor for ArithmeticExecutor {
    async fn execute(&self, func: &[u8], args: Value, _kwargs: Value) -> TaskOutcome {
        let name = match std::str::from_utf8(func) {
            Ok(name) => name,
            Err(_) => {
                return TaskOutcome::Erred {
                    exception: "UnknownFunction".to_string(),
                    traceback: "function payload is not UTF-8".to_string(),
                }
            }
        };
        let args = match args {
            Value::Array(items) => items,
            Value::Nil => Vec::new(),
            single => vec![single],
        };
        match call(name, &args) {
            Ok(value) => TaskOutcome::Finished(value),
            Err(WorkerError::Execution { exception }) => TaskOutcome::Erred {
                exception,
                traceback: format!("in builtin function {name}"),
            },
            Err(other) => TaskOutcome::from_error(&other, format!("in builtin function {name}")),
        }
    }
}

fn call(name: &str, args: &[Value]) -> Result<Value, WorkerError> {
    match name {
        "identity" => Ok(args.first().cloned().unwrap_or(Value::Nil)),
        "int" => {
            let arg = one_arg(name, args)?;
            if let Some(n) = arg.as_i64() {
                return Ok(Value::from(n));
            }
            match arg.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                Some(_) => Err(WorkerError::Execution { exception: "InexactError".to_string() }),
                None => Err(bad_argument(name, arg)),
            }
        }
        "add" | "+" => fold_numeric(name, args, |a, b| a + b, |a, b| a + b),
        "sub" | "-" => fold_numeric(name, args, |a, b| a - b, |a, b| a - b),
        "mul" | "*" => fold_numeric(name, args, |a, b| a * b, |a, b| a * b),
        "str" => {
            let arg = one_arg(name, args)?;
            Ok(Value::from(format!("{arg}")))
        }
        other => Err(WorkerError::Execution { exception: format!("UnknownFunction: {other}") }),
    }
}

fn one_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, WorkerError> {
    match args {
        [arg] => Ok(arg),
        _ => Err(WorkerError::Execution {
            exception: format!("ArgumentError: {name} takes 1 argument, got {}", args.len()),
        }),
    }
}

fn bad_argument(name: &str, arg: &Value) -> WorkerError {
    WorkerError::Execution { exception: format!("ArgumentError: {name} cannot take {arg}") }
}

/// Fold numeric arguments, staying integral while every operand is integral.
fn fold_numeric(
    name: &str,
    args: &[Value],
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, WorkerError> {
    if args.is_empty() {
        return Err(WorkerError::Execution {
            exception: format!("ArgumentError: {name} takes at least 1 argument"),
        });
    }
    let all_integral = args.iter().all(|a| a.as_i64().is_some());
    if all_integral {
        let mut acc = args[0].as_i64().expect("checked integral");
        for arg in &args[1..] {
            acc = int_op(acc, arg.as_i64().expect("checked integral"));
        }
        Ok(Value::from(acc))
    } else {
        let mut acc = as_f64(name, &args[0])?;
        for arg in &args[1..] {
            acc = float_op(acc, as_f64(name, arg)?);
        }
        Ok(Value::from(acc))
    }
}

fn as_f64(name: &str, arg: &Value) -> Result<f64, WorkerError> {
    arg.as_f64()
        .or_else(|| arg.as_i64().map(|n| n as f64))
        .ok_or_else(|| bad_argument(name, arg))
}
