use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{Row, RowOrder, ValueMatch};

const MAX_DISPLAYED_ENTRIES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffEntry {
    /// Expected row with no counterpart in the actual result.
    Missing { index: usize, row: Row },
    /// Actual row with no counterpart in the expected result.
    Extra { index: usize, row: Row },
    /// Same position, different cells. `columns` lists the differing positions;
    /// a differing column count lists every column of the wider row.
    Changed {
        index: usize,
        expected: Row,
        actual: Row,
        columns: Vec<usize>,
    },
}

/// Structural difference between an expected and an actual row-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDiff {
    pub order: RowOrder,
    pub expected_rows: usize,
    pub actual_rows: usize,
    pub entries: Vec<DiffEntry>,
}

impl RowDiff {
    /// Returns `None` when the two row-sets match under `order` and `matching`.
    pub fn compute(expected: &[Row], actual: &[Row], order: RowOrder, matching: ValueMatch) -> Option<Self> {
        let entries = match order {
            RowOrder::Exact => diff_exact(expected, actual, matching),
            RowOrder::Unordered => diff_unordered(expected, actual, matching),
        };
        if entries.is_empty() {
            return None;
        }
        Some(Self {
            order,
            expected_rows: expected.len(),
            actual_rows: actual.len(),
            entries,
        })
    }
}

pub fn rows_match(expected: &Row, actual: &Row, matching: ValueMatch) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(e, a)| e.matches_with(a, matching))
}

fn diff_exact(expected: &[Row], actual: &[Row], matching: ValueMatch) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    for index in 0..expected.len().max(actual.len()) {
        match (expected.get(index), actual.get(index)) {
            (Some(e), Some(a)) => {
                let columns = differing_columns(e, a, matching);
                if !columns.is_empty() {
                    entries.push(DiffEntry::Changed {
                        index,
                        expected: e.clone(),
                        actual: a.clone(),
                        columns,
                    });
                }
            }
            (Some(e), None) => entries.push(DiffEntry::Missing {
                index,
                row: e.clone(),
            }),
            (None, Some(a)) => entries.push(DiffEntry::Extra {
                index,
                row: a.clone(),
            }),
            (None, None) => {}
        }
    }
    entries
}

fn differing_columns(expected: &Row, actual: &Row, matching: ValueMatch) -> Vec<usize> {
    if expected.len() != actual.len() {
        return (0..expected.len().max(actual.len())).collect();
    }
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter(|(_, (e, a))| !e.matches_with(a, matching))
        .map(|(idx, _)| idx)
        .collect()
}

fn diff_unordered(expected: &[Row], actual: &[Row], matching: ValueMatch) -> Vec<DiffEntry> {
    let mut used = vec![false; actual.len()];
    let mut entries = Vec::new();

    for (index, e) in expected.iter().enumerate() {
        let found = actual
            .iter()
            .enumerate()
            .position(|(i, a)| !used[i] && rows_match(e, a, matching));
        match found {
            Some(i) => used[i] = true,
            None => entries.push(DiffEntry::Missing {
                index,
                row: e.clone(),
            }),
        }
    }

    for (index, a) in actual.iter().enumerate() {
        if !used[index] {
            entries.push(DiffEntry::Extra {
                index,
                row: a.clone(),
            });
        }
    }
    entries
}

fn format_row(row: &Row) -> String {
    let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
    format!("[{}]", cells.join(", "))
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffEntry::Missing { index, row } => {
                write!(f, "row {}: missing {}", index, format_row(row))
            }
            DiffEntry::Extra { index, row } => {
                write!(f, "row {}: unexpected {}", index, format_row(row))
            }
            DiffEntry::Changed {
                index,
                expected,
                actual,
                columns,
            } => {
                if expected.len() != actual.len() {
                    return write!(
                        f,
                        "row {}: expected {} columns {}, got {} columns {}",
                        index,
                        expected.len(),
                        format_row(expected),
                        actual.len(),
                        format_row(actual)
                    );
                }
                write!(f, "row {}:", index)?;
                for (n, col) in columns.iter().enumerate() {
                    let sep = if n == 0 { " " } else { "; " };
                    write!(
                        f,
                        "{}column {}: expected {}, got {}",
                        sep, col, expected[*col], actual[*col]
                    )?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for RowDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.order {
            RowOrder::Exact => "ordered",
            RowOrder::Unordered => "unordered",
        };
        write!(
            f,
            "rows differ ({}, expected {} rows, got {})",
            order, self.expected_rows, self.actual_rows
        )?;
        for entry in self.entries.iter().take(MAX_DISPLAYED_ENTRIES) {
            write!(f, "\n  {}", entry)?;
        }
        if self.entries.len() > MAX_DISPLAYED_ENTRIES {
            write!(
                f,
                "\n  ... {} more differences",
                self.entries.len() - MAX_DISPLAYED_ENTRIES
            )?;
        }
        Ok(())
    }
}
