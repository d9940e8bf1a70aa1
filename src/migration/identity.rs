// ABOUTME: Identity remapping between source and target identifier spaces
// ABOUTME: Holds the per-run identity map, the foreign-key schema, and the FK rewrite/orphan filter

use crate::table::{row_key, TabularBuffer, Value};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Suffix marking a column as a reference when inference is enabled
pub const FOREIGN_KEY_SUFFIX: &str = "_id";

/// `column` of some table holds identifiers of `references`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
}

impl ForeignKey {
    pub fn new(column: &str, references: &str) -> Self {
        Self {
            column: column.to_string(),
            references: references.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Declared,
    /// Derived from a `<table>_id` column name
    Inferred,
}

/// Declared foreign keys per table, with optional naming-convention fallback
#[derive(Debug, Clone, Default)]
pub struct ForeignKeySchema {
    declared: BTreeMap<String, Vec<ForeignKey>>,
    infer: bool,
}

impl ForeignKeySchema {
    pub fn new(declared: BTreeMap<String, Vec<ForeignKey>>, infer: bool) -> Self {
        Self { declared, infer }
    }

    pub fn declared(&self, table: &str) -> Option<&[ForeignKey]> {
        self.declared.get(table).map(Vec::as_slice)
    }

    /// Foreign keys that apply to a staged buffer of `table` with `columns`
    ///
    /// A declared list always wins, even when empty. Without one, and only when
    /// inference is on, every `<name>_id` column other than the identity column
    /// is taken to reference table `<name>`. Declared columns missing from the
    /// buffer are ignored.
    pub fn keys_for(
        &self,
        table: &str,
        columns: &[String],
        identity_column: &str,
    ) -> Vec<(ForeignKey, KeyOrigin)> {
        if let Some(keys) = self.declared(table) {
            return keys
                .iter()
                .filter(|key| {
                    let present = columns.contains(&key.column);
                    if !present {
                        tracing::debug!(
                            "Declared foreign key {}.{} not in staged columns, ignoring",
                            table,
                            key.column
                        );
                    }
                    present
                })
                .map(|key| (key.clone(), KeyOrigin::Declared))
                .collect();
        }

        if !self.infer {
            return Vec::new();
        }

        columns
            .iter()
            .filter(|column| column.as_str() != identity_column)
            .filter_map(|column| {
                let parent = column.strip_suffix(FOREIGN_KEY_SUFFIX)?;
                (!parent.is_empty()).then(|| (ForeignKey::new(column, parent), KeyOrigin::Inferred))
            })
            .collect()
    }
}

/// Source id -> target id, per table imported in the current run
///
/// An entry for a table appears only once that table's import has finished.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    tables: HashMap<String, HashMap<Value, Value>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, table: &str, mapping: HashMap<Value, Value>) {
        self.tables.insert(table.to_string(), mapping);
    }

    pub fn get(&self, table: &str) -> Option<&HashMap<Value, Value>> {
        self.tables.get(table)
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn lookup(&self, table: &str, source_id: &Value) -> Option<&Value> {
        self.tables.get(table)?.get(source_id)
    }
}

/// How values of one foreign-key column get checked
pub enum ParentIds<'a> {
    /// Parent imported earlier this run: rewrite through its map
    Mapped(&'a HashMap<Value, Value>),
    /// Parent not imported this run: values must already exist in the target
    Live(HashSet<Value>),
}

/// Result of checking one foreign-key column
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCheck {
    /// Rows to keep; orphans are `false`
    pub keep: Vec<bool>,
    pub rewritten: usize,
    /// Values with no entry in the parent's map, left as they were
    pub unmapped: usize,
    pub orphans: usize,
}

/// Rewrite or validate one foreign-key column
///
/// Null references are kept untouched. With a mapped parent every row is kept;
/// with a live parent the returned buffer is unchanged and orphans are flagged in
/// `keep` for the caller to drop.
pub fn check_foreign_key(
    rows: TabularBuffer,
    key: &ForeignKey,
    parents: &ParentIds<'_>,
) -> (TabularBuffer, KeyCheck) {
    let mut check = KeyCheck {
        keep: vec![true; rows.len()],
        ..KeyCheck::default()
    };

    match parents {
        ParentIds::Mapped(mapping) => {
            let rows = rows.map_column(&key.column, |value| {
                if value.is_null() {
                    return value;
                }
                match mapping.get(&value) {
                    Some(target) => {
                        check.rewritten += 1;
                        target.clone()
                    }
                    None => {
                        check.unmapped += 1;
                        value
                    }
                }
            });
            (rows, check)
        }
        ParentIds::Live(valid) => {
            if let Some(values) = rows.column_values(&key.column) {
                for (keep, value) in check.keep.iter_mut().zip(values) {
                    if !value.is_null() && !valid.contains(value) {
                        *keep = false;
                        check.orphans += 1;
                    }
                }
            }
            (rows, check)
        }
    }
}

/// Map each staged row's source id to the id the target holds for its natural key
///
/// `staged` and `source_ids` are aligned row for row. Rows whose key is not in
/// the target, or whose source id is null, get no entry. When the target holds
/// several rows with one key, the first one read wins.
pub fn build_identity_map(
    staged: &TabularBuffer,
    source_ids: &[Value],
    target: &TabularBuffer,
    key_columns: &[String],
    identity_column: &str,
) -> Result<HashMap<Value, Value>> {
    let staged_idx = staged
        .indices_of(key_columns)
        .context("Natural key not found in staged rows")?;
    let target_idx = target
        .indices_of(key_columns)
        .context("Natural key not found in target table")?;
    let id_idx = target.column_index(identity_column).with_context(|| {
        format!(
            "Identity column '{}' not found in target table",
            identity_column
        )
    })?;

    let mut by_key: HashMap<Vec<Value>, Value> = HashMap::with_capacity(target.len());
    for row in target.rows() {
        by_key
            .entry(row_key(row, &target_idx))
            .or_insert_with(|| row[id_idx].clone());
    }

    let mut mapping = HashMap::with_capacity(source_ids.len());
    for (row, source_id) in staged.rows().iter().zip(source_ids) {
        if source_id.is_null() {
            continue;
        }
        if let Some(target_id) = by_key.get(&row_key(row, &staged_idx)) {
            mapping.insert(source_id.clone(), target_id.clone());
        }
    }

    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(columns: &[&str], rows: Vec<Vec<Value>>) -> TabularBuffer {
        TabularBuffer::from_rows(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_declared_keys_win_over_inference() {
        let mut declared = BTreeMap::new();
        declared.insert(
            "current_weather".to_string(),
            vec![ForeignKey::new("loc", "location")],
        );
        let schema = ForeignKeySchema::new(declared, true);

        let keys = schema.keys_for(
            "current_weather",
            &cols(&["loc", "location_id", "temp"]),
            "id",
        );
        assert_eq!(
            keys,
            vec![(ForeignKey::new("loc", "location"), KeyOrigin::Declared)]
        );
    }

    #[test]
    fn test_inference_is_opt_in() {
        let columns = cols(&["id", "location_id", "_id", "temp"]);

        let off = ForeignKeySchema::new(BTreeMap::new(), false);
        assert!(off.keys_for("current_weather", &columns, "id").is_empty());

        let on = ForeignKeySchema::new(BTreeMap::new(), true);
        assert_eq!(
            on.keys_for("current_weather", &columns, "id"),
            vec![(
                ForeignKey::new("location_id", "location"),
                KeyOrigin::Inferred
            )]
        );
    }

    #[test]
    fn test_declared_column_missing_from_buffer_is_ignored() {
        let mut declared = BTreeMap::new();
        declared.insert("t".to_string(), vec![ForeignKey::new("gone_id", "gone")]);
        let schema = ForeignKeySchema::new(declared, false);
        assert!(schema.keys_for("t", &cols(&["a"]), "id").is_empty());
    }

    #[test]
    fn test_mapped_parent_rewrites_and_leaves_unmapped() {
        let mut mapping = HashMap::new();
        mapping.insert(Value::Int(1), Value::Int(101));
        mapping.insert(Value::Int(2), Value::Int(102));

        let rows = buffer(
            &["parent_id", "value"],
            vec![
                vec![Value::Int(2), "a".into()],
                vec![Value::Int(9), "b".into()],
                vec![Value::Null, "c".into()],
            ],
        );

        let key = ForeignKey::new("parent_id", "parent");
        let (rows, check) = check_foreign_key(rows, &key, &ParentIds::Mapped(&mapping));

        assert_eq!(check.rewritten, 1);
        assert_eq!(check.unmapped, 1);
        assert_eq!(check.orphans, 0);
        assert_eq!(check.keep, vec![true, true, true]);
        let ids: Vec<Value> = rows.column_values("parent_id").unwrap().into_iter().cloned().collect();
        assert_eq!(ids, vec![Value::Int(102), Value::Int(9), Value::Null]);
    }

    #[test]
    fn test_live_parent_flags_orphans() {
        let valid: HashSet<Value> = [Value::Int(5)].into_iter().collect();
        let rows = buffer(
            &["parent_id"],
            vec![vec![Value::Int(5)], vec![Value::Int(6)], vec![Value::Null]],
        );

        let key = ForeignKey::new("parent_id", "parent");
        let (_, check) = check_foreign_key(rows, &key, &ParentIds::Live(valid));

        assert_eq!(check.keep, vec![true, false, true]);
        assert_eq!(check.orphans, 1);
    }

    #[test]
    fn test_build_identity_map() {
        let staged = buffer(
            &["name"],
            vec![vec!["London".into()], vec!["Paris".into()], vec!["Rome".into()]],
        );
        let source_ids = vec![Value::Int(1), Value::Int(2), Value::Null];
        let target = buffer(
            &["id", "name"],
            vec![
                vec![Value::Int(40), "Paris".into()],
                vec![Value::Int(41), "London".into()],
                vec![Value::Int(42), "Rome".into()],
            ],
        );

        let mapping =
            build_identity_map(&staged, &source_ids, &target, &cols(&["name"]), "id").unwrap();

        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping[&Value::Int(1)], Value::Int(41));
        assert_eq!(mapping[&Value::Int(2)], Value::Int(40));

        let mut map = IdentityMap::new();
        assert!(!map.contains("location"));
        map.record("location", mapping);
        assert_eq!(
            map.lookup("location", &Value::Float(2.0)),
            Some(&Value::Int(40))
        );
    }

    #[test]
    fn test_build_identity_map_needs_identity_column() {
        let staged = buffer(&["name"], vec![vec!["x".into()]]);
        let target = buffer(&["name"], vec![vec!["x".into()]]);
        let err = build_identity_map(&staged, &[Value::Int(1)], &target, &cols(&["name"]), "id")
            .unwrap_err();
        assert!(err.to_string().contains("Identity column"));
    }
}
