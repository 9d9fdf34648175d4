//! Error types shared across the agent core.
//!
//! Low-level modules define their own error enums (`ApiError`, `TapError`,
//! `StoreError`); the kinds below are the ones that cross activity
//! boundaries and that the workflow engine is expected to match on.

use std::fmt;

use thiserror::Error;

/// Errors surfaced by the agent core.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The IP block pool is exhausted.
    #[error("no free IP block in the pool")]
    NoFreeIpBlock,

    /// The VM never accepted SSH within the boot deadline.
    #[error("VM {instance_id} did not accept SSH within {timeout_secs}s")]
    VmBootTimeout {
        instance_id: String,
        timeout_secs: u64,
    },

    /// A remote command exited non-zero and the caller did not tolerate it.
    #[error("remote command exited with code {code}: {stderr}")]
    SshExecFailed { code: i32, stderr: String },

    /// The SSH session backing an in-flight exec was disposed.
    #[error("SSH session disposed")]
    SshDisposed,

    /// A captured value did not match its schema.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Two or more failures that must be surfaced together.
    #[error("{0}")]
    Composite(CompositeError),
}

/// An ordered list of failures reported jointly, e.g. a task failure plus
/// the failure to persist its status.
#[derive(Debug)]
pub struct CompositeError {
    causes: Vec<anyhow::Error>,
}

impl CompositeError {
    /// The individual failures, in the order they occurred.
    pub fn causes(&self) -> &[anyhow::Error] {
        &self.causes
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.causes.len())?;
        for (i, cause) in self.causes.iter().enumerate() {
            write!(f, " [{}] {:#};", i, cause)?;
        }
        Ok(())
    }
}

/// Combine failures into a single error, flattening nested composites so the
/// cause list stays ordered and one level deep. A single cause is returned
/// unwrapped.
pub fn composite(causes: Vec<anyhow::Error>) -> anyhow::Error {
    let mut flat: Vec<anyhow::Error> = Vec::with_capacity(causes.len());
    for cause in causes {
        match cause.downcast::<AgentError>() {
            Ok(AgentError::Composite(inner)) => flat.extend(inner.causes),
            Ok(other) => flat.push(anyhow::Error::new(other)),
            Err(err) => flat.push(err),
        }
    }

    if flat.len() == 1 {
        if let Some(single) = flat.pop() {
            return single;
        }
    }
    if flat.is_empty() {
        return anyhow::anyhow!("composite error with no causes");
    }
    anyhow::Error::new(AgentError::Composite(CompositeError { causes: flat }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_preserves_order() {
        let err = composite(vec![
            anyhow::anyhow!("first"),
            anyhow::anyhow!("second"),
        ]);

        let agent_err = err.downcast_ref::<AgentError>().unwrap();
        match agent_err {
            AgentError::Composite(inner) => {
                assert_eq!(inner.causes().len(), 2);
                assert_eq!(inner.causes()[0].to_string(), "first");
                assert_eq!(inner.causes()[1].to_string(), "second");
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[test]
    fn test_composite_flattens_nested() {
        let inner = composite(vec![anyhow::anyhow!("a"), anyhow::anyhow!("b")]);
        let outer = composite(vec![inner, anyhow::anyhow!("c")]);

        match outer.downcast_ref::<AgentError>().unwrap() {
            AgentError::Composite(c) => {
                let msgs: Vec<String> = c.causes().iter().map(|e| e.to_string()).collect();
                assert_eq!(msgs, vec!["a", "b", "c"]);
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[test]
    fn test_single_cause_unwrapped() {
        let err = composite(vec![anyhow::Error::new(AgentError::NoFreeIpBlock)]);
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::NoFreeIpBlock)
        ));
    }
}
