//! Batch arguments and results

use crate::error::{TaskPoolError, TaskPoolResult};
use std::fmt;

/// One positional argument of a batch call.
///
/// A scalar is passed unchanged to every call; a collection supplies the
/// i-th value to the i-th call.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg<T> {
    Scalar(T),
    Each(Vec<T>),
}

/// Why a slot of the batch holds no result
#[derive(Debug)]
pub enum TaskError<E> {
    /// The callable returned an error
    Failed(E),
    /// The callable panicked; carries the panic message
    Panicked(String),
    /// The task never ran to completion
    Abandoned,
}

/// A failed slot of the batch
#[derive(Debug)]
pub struct TaskFailure<E> {
    pub index: usize,
    pub error: TaskError<E>,
}

/// Results of one batch, in input order
#[derive(Debug)]
pub struct BatchResult<R, E> {
    /// `results[i]` is the outcome of the i-th call, `None` if it failed
    pub results: Vec<Option<R>>,
    /// One entry per `None` slot, sorted by index
    pub failures: Vec<TaskFailure<E>>,
}

impl<E: fmt::Display> fmt::Display for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(e) => write!(f, "task failed: {}", e),
            TaskError::Panicked(msg) => write!(f, "task panicked: {}", msg),
            TaskError::Abandoned => f.write_str("task abandoned"),
        }
    }
}

impl<R, E> BatchResult<R, E> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// True when every call produced a result
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_results(self) -> Vec<Option<R>> {
        self.results
    }
}

/// Expand positional arguments into one argument vector per call.
pub(crate) fn expand<T: Clone>(args: &[Arg<T>]) -> TaskPoolResult<Vec<Vec<T>>> {
    let mut len = None;
    for arg in args {
        if let Arg::Each(values) = arg {
            match len {
                None => len = Some(values.len()),
                Some(n) if n != values.len() => {
                    return Err(TaskPoolError::InvalidArguments(format!(
                        "argument collections differ in length ({} and {})",
                        n,
                        values.len()
                    )));
                }
                Some(_) => {}
            }
        }
    }

    let len = len.ok_or_else(|| {
        TaskPoolError::InvalidArguments("at least one argument collection is required".into())
    })?;

    Ok((0..len)
        .map(|i| {
            args.iter()
                .map(|arg| match arg {
                    Arg::Scalar(value) => value.clone(),
                    Arg::Each(values) => values[i].clone(),
                })
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_are_broadcast() {
        let calls = expand(&[Arg::Scalar(10), Arg::Each(vec![1, 2, 3])]).unwrap();
        assert_eq!(calls, vec![vec![10, 1], vec![10, 2], vec![10, 3]]);
    }

    #[test]
    fn test_requires_a_collection() {
        let err = expand(&[Arg::Scalar(1), Arg::Scalar(2)]).unwrap_err();
        assert!(matches!(err, TaskPoolError::InvalidArguments(_)));

        let err = expand::<i32>(&[]).unwrap_err();
        assert!(matches!(err, TaskPoolError::InvalidArguments(_)));
    }

    #[test]
    fn test_rejects_mismatched_collections() {
        let err = expand(&[Arg::Each(vec![1, 2]), Arg::Each(vec![1])]).unwrap_err();
        assert!(err.to_string().contains("differ in length"));
    }

    #[test]
    fn test_empty_collection_gives_empty_batch() {
        let calls = expand(&[Arg::Scalar(1), Arg::Each(vec![])]).unwrap();
        assert!(calls.is_empty());
    }
}
