use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::{Step, UserId};
use crate::transform::{Transform, TransformError};

/// One accepted step together with the user that authored it.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub step: Step,
    pub author: UserId,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version {requested} is out of range, current version is {current}")]
    VersionOutOfRange { requested: u64, current: u64 },
    #[error(transparent)]
    InvalidStep(#[from] TransformError),
}

/// Outcome of a compare-and-append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Accepted { version: u64 },
    Rejected { version: u64 },
}

/// Canonical document, version counter and append-only step log.
///
/// The version is the count of steps ever applied; `version == log.len()` is
/// an invariant. Step application is delegated to the injected transform.
pub struct DocumentStore {
    document: Value,
    log: Vec<LogEntry>,
    transform: Arc<dyn Transform>,
}

impl DocumentStore {
    pub fn new(initial: Value, transform: Arc<dyn Transform>) -> Self {
        Self {
            document: initial,
            log: Vec::new(),
            transform,
        }
    }

    pub fn version(&self) -> u64 {
        self.log.len() as u64
    }

    /// Current document and version; no side effects.
    pub fn snapshot(&self) -> (&Value, u64) {
        (&self.document, self.version())
    }

    /// Suffix of the step log at or after `from`, for reconnect catch-up.
    pub fn steps_since(&self, from: u64) -> Result<&[LogEntry], StoreError> {
        if from > self.version() {
            return Err(StoreError::VersionOutOfRange {
                requested: from,
                current: self.version(),
            });
        }
        Ok(&self.log[from as usize..])
    }

    /// Compare-and-append: applies the batch only if `declared` matches the
    /// current version. All-or-nothing; an invalid step anywhere in the batch
    /// leaves the store untouched.
    pub fn apply_if_current(
        &mut self,
        steps: &[Step],
        declared: u64,
        author: &str,
    ) -> Result<Applied, StoreError> {
        let current = self.version();
        if declared != current {
            debug!(declared, current, "rejecting batch, version mismatch");
            return Ok(Applied::Rejected { version: current });
        }

        // Stage on a scratch copy so a mid-batch failure cannot leave a
        // partially applied document behind.
        let mut staged = self.document.clone();
        for step in steps {
            staged = self.transform.apply(&staged, step)?;
        }

        self.document = staged;
        self.log.extend(steps.iter().map(|step| LogEntry {
            step: step.clone(),
            author: author.to_string(),
        }));
        Ok(Applied::Accepted {
            version: self.version(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::text::TextTransform;
    use serde_json::json;

    fn store(text: &str) -> DocumentStore {
        DocumentStore::new(Value::String(text.into()), Arc::new(TextTransform))
    }

    fn insert(pos: usize, text: &str) -> Step {
        Step(json!({"type": "insert", "pos": pos, "text": text}))
    }

    #[test]
    fn version_counts_every_applied_step() {
        let mut s = store("");
        s.apply_if_current(&[insert(0, "a"), insert(1, "b")], 0, "u1")
            .unwrap();
        s.apply_if_current(&[insert(2, "c")], 2, "u2").unwrap();
        assert_eq!(s.version(), 3);
        assert_eq!(s.snapshot().0, &Value::String("abc".into()));
    }

    #[test]
    fn matching_version_accepts_then_same_version_rejects() {
        let mut s = store("");
        let first = s.apply_if_current(&[insert(0, "x")], 0, "u1").unwrap();
        assert_eq!(first, Applied::Accepted { version: 1 });
        let second = s.apply_if_current(&[insert(0, "y")], 0, "u2").unwrap();
        assert_eq!(second, Applied::Rejected { version: 1 });
        assert_eq!(s.snapshot().0, &Value::String("x".into()));
    }

    #[test]
    fn invalid_step_rejects_whole_batch_without_mutation() {
        let mut s = store("ab");
        let result = s.apply_if_current(&[insert(0, "x"), insert(99, "y")], 0, "u1");
        assert!(matches!(result, Err(StoreError::InvalidStep(_))));
        assert_eq!(s.version(), 0);
        assert_eq!(s.snapshot().0, &Value::String("ab".into()));
    }

    #[test]
    fn steps_since_replays_to_current_document() {
        let mut s = store("start");
        let snapshot_at_zero = s.snapshot().0.clone();
        s.apply_if_current(&[insert(5, "!")], 0, "u1").unwrap();
        s.apply_if_current(&[insert(0, ">"), insert(1, ">")], 1, "u2")
            .unwrap();

        let t = TextTransform;
        let mut replayed = snapshot_at_zero;
        for entry in s.steps_since(0).unwrap() {
            replayed = t.apply(&replayed, &entry.step).unwrap();
        }
        assert_eq!(&replayed, s.snapshot().0);
    }

    #[test]
    fn steps_since_suffix_and_range_check() {
        let mut s = store("");
        s.apply_if_current(&[insert(0, "a")], 0, "u1").unwrap();
        s.apply_if_current(&[insert(1, "b")], 1, "u2").unwrap();

        let suffix = s.steps_since(1).unwrap();
        assert_eq!(suffix.len(), 1);
        assert_eq!(suffix[0].author, "u2");
        assert!(s.steps_since(2).unwrap().is_empty());
        assert!(matches!(
            s.steps_since(3),
            Err(StoreError::VersionOutOfRange { requested: 3, current: 2 })
        ));
    }
}
