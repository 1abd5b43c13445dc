use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Rebased, Transform, TransformError};
use crate::models::Step;

/// Plain-text transform over insert/delete steps.
///
/// Stands in for the rich-text transform library the embedding editor would
/// inject. Documents are JSON strings; positions are character offsets.
pub struct TextTransform;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TextStep {
    Insert { pos: usize, text: String },
    Delete { from: usize, to: usize },
}

impl TextStep {
    fn decode(step: &Step) -> Result<Self, TransformError> {
        Ok(serde_json::from_value(step.0.clone())?)
    }

    fn encode(&self) -> Step {
        // Serializing a tagged enum of plain fields cannot fail.
        Step(serde_json::to_value(self).unwrap_or(Value::Null))
    }

    fn is_noop(&self) -> bool {
        match self {
            TextStep::Insert { text, .. } => text.is_empty(),
            TextStep::Delete { from, to } => from >= to,
        }
    }

    fn noop() -> Self {
        TextStep::Insert {
            pos: 0,
            text: String::new(),
        }
    }
}

impl TextTransform {
    fn apply_decoded(&self, document: &Value, step: &TextStep) -> Result<Value, TransformError> {
        let text = document
            .as_str()
            .ok_or_else(|| TransformError::InvalidStep("document is not text".into()))?;
        let mut chars: Vec<char> = text.chars().collect();
        match step {
            TextStep::Insert { pos, text } => {
                if *pos > chars.len() {
                    return Err(TransformError::InvalidStep(format!(
                        "insert position {pos} beyond document length {}",
                        chars.len()
                    )));
                }
                chars.splice(*pos..*pos, text.chars());
            }
            TextStep::Delete { from, to } => {
                if from > to || *to > chars.len() {
                    return Err(TransformError::InvalidStep(format!(
                        "delete range {from}..{to} invalid for document length {}",
                        chars.len()
                    )));
                }
                chars.drain(*from..*to);
            }
        }
        Ok(Value::String(chars.into_iter().collect()))
    }
}

/// Map `step` over a concurrent `other` applied to the same base document.
///
/// `wins_ties` decides which insert goes first when both insert at the same
/// position. Returns `None` when the step is entirely absorbed.
fn transform_over(step: &TextStep, other: &TextStep, wins_ties: bool) -> Option<TextStep> {
    let mapped = match (step, other) {
        (TextStep::Insert { pos, text }, TextStep::Insert { pos: opos, text: otext }) => {
            let shift = *opos < *pos || (*opos == *pos && !wins_ties);
            TextStep::Insert {
                pos: if shift { pos + otext.chars().count() } else { *pos },
                text: text.clone(),
            }
        }
        (TextStep::Insert { pos, text }, TextStep::Delete { from, to }) => TextStep::Insert {
            pos: map_over_delete(*pos, *from, *to),
            text: text.clone(),
        },
        (TextStep::Delete { from, to }, TextStep::Insert { pos, text }) => {
            let len = text.chars().count();
            if *pos <= *from {
                TextStep::Delete {
                    from: from + len,
                    to: to + len,
                }
            } else if *pos >= *to {
                TextStep::Delete { from: *from, to: *to }
            } else {
                // Insert landed inside the deleted range; the delete swallows
                // it so both replicas converge on the same document.
                TextStep::Delete {
                    from: *from,
                    to: to + len,
                }
            }
        }
        (TextStep::Delete { from, to }, TextStep::Delete { from: ofrom, to: oto }) => {
            TextStep::Delete {
                from: map_over_delete(*from, *ofrom, *oto),
                to: map_over_delete(*to, *ofrom, *oto),
            }
        }
    };
    if mapped.is_noop() {
        None
    } else {
        Some(mapped)
    }
}

fn map_over_delete(pos: usize, from: usize, to: usize) -> usize {
    if pos <= from {
        pos
    } else if pos >= to {
        pos - (to - from)
    } else {
        from
    }
}

/// Remap a sequential run of pending steps over a sequential run of incoming
/// steps, both produced against the same base document. Incoming steps win
/// position ties; pending steps that get absorbed are dropped.
fn rebase_steps(incoming: &[TextStep], pending: &[TextStep]) -> Vec<TextStep> {
    let mut incoming: Vec<TextStep> = incoming.to_vec();
    let mut rebased = Vec::with_capacity(pending.len());
    for step in pending {
        let mut current = Some(step.clone());
        for slot in incoming.iter_mut() {
            let Some(step_now) = current else { break };
            let other = slot.clone();
            current = transform_over(&step_now, &other, false);
            *slot = transform_over(&other, &step_now, true).unwrap_or_else(TextStep::noop);
        }
        if let Some(step) = current {
            rebased.push(step);
        }
    }
    rebased
}

impl Transform for TextTransform {
    fn apply(&self, document: &Value, step: &Step) -> Result<Value, TransformError> {
        let decoded = TextStep::decode(step)?;
        self.apply_decoded(document, &decoded)
    }

    fn rebase(
        &self,
        document: &Value,
        incoming: &[Step],
        pending: &[Step],
    ) -> Result<Rebased, TransformError> {
        let incoming_decoded = incoming
            .iter()
            .map(TextStep::decode)
            .collect::<Result<Vec<_>, _>>()?;
        let pending_decoded = pending
            .iter()
            .map(TextStep::decode)
            .collect::<Result<Vec<_>, _>>()?;

        let mut doc = document.clone();
        for step in &incoming_decoded {
            doc = self.apply_decoded(&doc, step)?;
        }
        let pending = rebase_steps(&incoming_decoded, &pending_decoded)
            .iter()
            .map(TextStep::encode)
            .collect();
        Ok(Rebased {
            document: doc,
            pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert(pos: usize, text: &str) -> Step {
        Step(json!({"type": "insert", "pos": pos, "text": text}))
    }

    fn delete(from: usize, to: usize) -> Step {
        Step(json!({"type": "delete", "from": from, "to": to}))
    }

    fn doc(text: &str) -> Value {
        Value::String(text.to_string())
    }

    #[test]
    fn applies_insert_and_delete() {
        let t = TextTransform;
        let d = t.apply(&doc("Hello"), &insert(5, " world")).unwrap();
        assert_eq!(d, doc("Hello world"));
        let d = t.apply(&d, &delete(0, 6)).unwrap();
        assert_eq!(d, doc("world"));
    }

    #[test]
    fn rejects_out_of_bounds_steps() {
        let t = TextTransform;
        assert!(matches!(
            t.apply(&doc("abc"), &insert(4, "x")),
            Err(TransformError::InvalidStep(_))
        ));
        assert!(matches!(
            t.apply(&doc("abc"), &delete(2, 9)),
            Err(TransformError::InvalidStep(_))
        ));
    }

    #[test]
    fn rejects_unparsable_step() {
        let t = TextTransform;
        let bad = Step(json!({"type": "spin", "degrees": 90}));
        assert!(matches!(
            t.apply(&doc("abc"), &bad),
            Err(TransformError::MalformedStep(_))
        ));
    }

    #[test]
    fn rebase_shifts_pending_insert_past_foreign_insert() {
        let t = TextTransform;
        let rebased = t
            .rebase(&doc("abc"), &[insert(0, "XY")], &[insert(3, "!")])
            .unwrap();
        assert_eq!(rebased.document, doc("XYabc"));
        assert_eq!(rebased.pending, vec![insert(5, "!")]);
    }

    #[test]
    fn rebase_drops_pending_delete_absorbed_by_foreign_delete() {
        let t = TextTransform;
        let rebased = t
            .rebase(&doc("abcdef"), &[delete(1, 5)], &[delete(2, 4)])
            .unwrap();
        assert_eq!(rebased.document, doc("af"));
        assert!(rebased.pending.is_empty());
    }

    #[test]
    fn rebase_converges_with_server_order() {
        // Server applies foreign then rebased-local; the rebased pending steps
        // must reproduce the same final document on both sides.
        let t = TextTransform;
        let base = doc("hello");
        let foreign = vec![insert(0, ">> ")];
        let pending = vec![insert(5, "!"), insert(6, "?")];

        let rebased = t.rebase(&base, &foreign, &pending).unwrap();
        let mut server_doc = base.clone();
        for step in foreign.iter().chain(rebased.pending.iter()) {
            server_doc = t.apply(&server_doc, step).unwrap();
        }
        let mut client_doc = rebased.document.clone();
        for step in &rebased.pending {
            client_doc = t.apply(&client_doc, step).unwrap();
        }
        assert_eq!(server_doc, client_doc);
        assert_eq!(client_doc, doc(">> hello!?"));
    }

    #[test]
    fn tie_break_puts_foreign_insert_first() {
        let t = TextTransform;
        let rebased = t
            .rebase(&doc("ab"), &[insert(1, "F")], &[insert(1, "L")])
            .unwrap();
        assert_eq!(rebased.pending, vec![insert(2, "L")]);
    }
}
