// ABOUTME: Dedup policy and the anti-join that keeps already-present rows out of the target
// ABOUTME: Keys are per-table natural-key columns, or the whole row when none are configured

use crate::table::{row_key, TabularBuffer, Value};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};

/// Natural-key columns per table
///
/// Built once from the jobs file and only ever read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupPolicy {
    keys: BTreeMap<String, Vec<String>>,
}

/// Which staged rows survive dedup, and why the others did not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupPlan {
    /// One flag per staged row; `true` means insert
    pub keep: Vec<bool>,
    /// Rows whose key is already in the target
    pub already_present: usize,
    /// Rows whose key repeats an earlier row of the same batch
    pub repeated: usize,
}

impl DedupPlan {
    pub fn kept(&self) -> usize {
        self.keep.iter().filter(|k| **k).count()
    }

    pub fn skipped(&self) -> usize {
        self.already_present + self.repeated
    }
}

/// Rows left to insert after dedup, with the counts of those taken out
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduped {
    pub rows: TabularBuffer,
    pub already_present: usize,
    pub repeated: usize,
}

impl Deduped {
    pub fn skipped(&self) -> usize {
        self.already_present + self.repeated
    }
}

impl DedupPolicy {
    pub fn new(keys: BTreeMap<String, Vec<String>>) -> Self {
        Self { keys }
    }

    /// A copy of this policy with `columns` as the key of every table in `tables`
    pub fn with_key_for(&self, tables: &[String], columns: &[String]) -> DedupPolicy {
        let mut keys = self.keys.clone();
        for table in tables {
            keys.insert(table.clone(), columns.to_vec());
        }
        DedupPolicy { keys }
    }

    pub fn key_columns(&self, table: &str) -> Option<&[String]> {
        self.keys.get(table).map(Vec::as_slice)
    }

    /// The columns identifying a row of `table`: the configured key, or every
    /// column of the (identity-stripped) buffer
    pub fn natural_key(&self, table: &str, buffer: &TabularBuffer) -> Vec<String> {
        match self.key_columns(table) {
            Some(columns) => columns.to_vec(),
            None => buffer.columns().to_vec(),
        }
    }

    /// Decide which `new_rows` must be inserted given what `existing` holds
    ///
    /// `existing` may carry extra columns (the identity column in particular);
    /// only the key columns are compared.
    pub fn plan(
        &self,
        table: &str,
        new_rows: &TabularBuffer,
        existing: &TabularBuffer,
    ) -> Result<DedupPlan> {
        let key = self.natural_key(table, new_rows);

        let new_idx = new_rows
            .indices_of(&key)
            .with_context(|| format!("Dedup key for '{}' not found in staged rows", table))?;

        let mut seen: HashSet<Vec<Value>> = if existing.is_empty() {
            HashSet::new()
        } else {
            let existing_idx = existing
                .indices_of(&key)
                .with_context(|| format!("Dedup key for '{}' not found in target table", table))?;
            existing
                .rows()
                .iter()
                .map(|row| row_key(row, &existing_idx))
                .collect()
        };
        let present = seen.clone();

        let mut plan = DedupPlan {
            keep: Vec::with_capacity(new_rows.len()),
            already_present: 0,
            repeated: 0,
        };

        for row in new_rows.rows() {
            let values = row_key(row, &new_idx);
            if present.contains(&values) {
                plan.already_present += 1;
                plan.keep.push(false);
            } else if !seen.insert(values) {
                plan.repeated += 1;
                plan.keep.push(false);
            } else {
                plan.keep.push(true);
            }
        }

        Ok(plan)
    }

    /// Filter `new_rows` down to the rows that must be inserted
    pub fn dedupe(
        &self,
        table: &str,
        new_rows: TabularBuffer,
        existing: &TabularBuffer,
    ) -> Result<Deduped> {
        if new_rows.is_empty() {
            return Ok(Deduped {
                rows: new_rows,
                ..Deduped::default()
            });
        }

        let plan = self.plan(table, &new_rows, existing)?;
        if plan.skipped() > 0 {
            tracing::info!(
                "  Skipping {} row(s) of '{}' already present ({} repeated within the file)",
                plan.skipped(),
                table,
                plan.repeated
            );
        }
        Ok(Deduped {
            rows: new_rows.retain_mask(&plan.keep),
            already_present: plan.already_present,
            repeated: plan.repeated,
        })
    }
}
