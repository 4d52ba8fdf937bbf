
use serde::{Deserialize, Serialize};

use crate::similarity::token_set_jaccard;

/// A single step of the token walk from `before` to `after`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffOp {
    Unchanged { token: String },
    Addition { token: String },
    Deletion { token: String },
    Modification { from: String, to: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Minor,
    Moderate,
    Major,
    CompleteReplacement,
}

impl std::fmt::Display for ChangeType {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ChangeType::Minor => write!(f, "minor"),
            ChangeType::Moderate => write!(f, "moderate"),
            ChangeType::Major => write!(f, "major"),
            ChangeType::CompleteReplacement => write!(f, "complete_replacement"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlags {
    pub case_only: bool,
    pub punctuation_only: bool,
    pub numeric_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub operations: Vec<DiffOp>,
    pub change_type: ChangeType,
    pub change_intensity: f64,
    pub similarity: f64,
    pub flags: ChangeFlags,
}

impl DiffResult {
    #[inline]
    pub fn additions(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().filter_map(|op| match op {
            DiffOp::Addition { token } => Some(token.as_str()),
            _ => None,
        })
    }

    #[inline]
    pub fn deletions(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().filter_map(|op| match op {
            DiffOp::Deletion { token } => Some(token.as_str()),
            _ => None,
        })
    }

    #[inline]
    pub fn has_changes(&self) -> bool {
        self.operations
            .iter()
            .any(|op| !matches!(op, DiffOp::Unchanged { .. }))
    }

    /// Replays the operations over `before` tokens.
    ///
    /// Returns `None` when the operations do not consume `before` exactly,
    /// i.e. the diff was computed for a different input.
    #[inline]
    pub fn apply(&self, before: &[&str]) -> Option<Vec<String>> {
        let mut cursor = 0;
        let mut output = Vec::with_capacity(self.operations.len());

        for op in &self.operations {
            match op {
                DiffOp::Unchanged { token } => {
                    if before.get(cursor) != Some(&token.as_str()) {
                        return None;
                    }
                    output.push(token.clone());
                    cursor += 1;
                }
                DiffOp::Deletion { token } => {
                    if before.get(cursor) != Some(&token.as_str()) {
                        return None;
                    }
                    cursor += 1;
                }
                DiffOp::Modification { from, to } => {
                    if before.get(cursor) != Some(&from.as_str()) {
                        return None;
                    }
                    output.push(to.clone());
                    cursor += 1;
                }
                DiffOp::Addition { token } => output.push(token.clone()),
            }
        }

        (cursor == before.len()).then_some(output)
    }
}

/// Greedy two-pointer token diff.
///
/// On a mismatch a single token of lookahead decides between insertion,
/// deletion and substitution; when both sides could resync the step is a substitution.
#[inline]
pub fn compute_diff(before: &str, after: &str) -> DiffResult {
    let a: Vec<&str> = before.split_whitespace().collect();
    let b: Vec<&str> = after.split_whitespace().collect();

    let mut operations = Vec::with_capacity(a.len().max(b.len()));
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            operations.push(DiffOp::Unchanged {
                token: a[i].to_string(),
            });
            i += 1;
            j += 1;
            continue;
        }

        let deletion_resyncs = a.get(i + 1) == Some(&b[j]);
        let insertion_resyncs = b.get(j + 1) == Some(&a[i]);

        match (deletion_resyncs, insertion_resyncs) {
            (true, false) => {
                operations.push(DiffOp::Deletion {
                    token: a[i].to_string(),
                });
                i += 1;
            }
            (false, true) => {
                operations.push(DiffOp::Addition {
                    token: b[j].to_string(),
                });
                j += 1;
            }
            _ => {
                operations.push(DiffOp::Modification {
                    from: a[i].to_string(),
                    to: b[j].to_string(),
                });
                i += 1;
                j += 1;
            }
        }
    }

    operations.extend(a[i..].iter().map(|t| DiffOp::Deletion {
        token: (*t).to_string(),
    }));
    operations.extend(b[j..].iter().map(|t| DiffOp::Addition {
        token: (*t).to_string(),
    }));

    let similarity = token_set_jaccard(before, after);
    let change_type = classify_change(similarity);
    let change_intensity = change_intensity(before, after, similarity);

    DiffResult {
        operations,
        change_type,
        change_intensity,
        similarity,
        flags: change_flags(before, after),
    }
}

fn classify_change(similarity: f64) -> ChangeType {
    if similarity >= 0.9 {
        ChangeType::Minor
    } else if similarity >= 0.7 {
        ChangeType::Moderate
    } else if similarity >= 0.4 {
        ChangeType::Major
    } else {
        ChangeType::CompleteReplacement
    }
}

fn change_intensity(before: &str, after: &str, similarity: f64) -> f64 {
    let len_before = before.chars().count();
    let len_after = after.chars().count();
    let longest = len_before.max(len_after).max(1);
    let length_delta = len_before.abs_diff(len_after) as f64 / longest as f64;

    0.7f64
        .mul_add(1.0 - similarity, 0.3 * length_delta)
        .clamp(0.0, 1.0)
}

fn change_flags(before: &str, after: &str) -> ChangeFlags {
    if before == after {
        return ChangeFlags::default();
    }

    let strip_punctuation = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_ascii_punctuation())
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    };
    let strip_digits = |s: &str| -> String { s.chars().filter(|c| !c.is_ascii_digit()).collect() };
    let digits = |s: &str| -> String { s.chars().filter(char::is_ascii_digit).collect() };

    ChangeFlags {
        case_only: before.to_lowercase() == after.to_lowercase(),
        punctuation_only: strip_punctuation(before) == strip_punctuation(after),
        numeric_only: digits(before) != digits(after)
            && strip_digits(before) == strip_digits(after),
    }
}
