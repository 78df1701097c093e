use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::{ScalingError, ScalingResult};
use crate::importer::{ImportTarget, SqlStatement};
use crate::test_utils::notify::TimedNotify;
use crate::types::{Cell, Operation};

/// A target row, by column name.
pub type Row = BTreeMap<String, Cell>;

/// Rows per table, keyed by the rendered unique key.
type Tables = HashMap<String, BTreeMap<String, Row>>;

type TablesCondition = Box<dyn Fn(&Tables) -> bool + Send + Sync>;

#[derive(Default)]
struct TargetInner {
    tables: Tables,
    executed_sql: Vec<String>,
    executions: usize,
    keyless_inserts: u64,
    failures: VecDeque<ScalingError>,
    conditions: Vec<(TablesCondition, Arc<Notify>)>,
}

impl TargetInner {
    /// Fires and drops every condition that holds for the current rows.
    fn check_conditions(&mut self) {
        let tables = &self.tables;
        self.conditions.retain(|(condition, notify)| {
            let holds = condition(tables);
            if holds {
                notify.notify_one();
            }

            !holds
        });
    }
}

impl fmt::Debug for TargetInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetInner")
            .field("tables", &self.tables)
            .field("executions", &self.executions)
            .field("pending_failures", &self.failures.len())
            .finish_non_exhaustive()
    }
}

/// In-memory target with the apply semantics of a real database.
///
/// Statement lists are applied atomically. Upserts replace the row with the same key, updates
/// and deletes of a missing row change nothing. Inserts without a key always add a row, as a
/// plain INSERT would.
#[derive(Debug, Clone, Default)]
pub struct MemoryImportTarget {
    inner: Arc<Mutex<TargetInner>>,
}

impl MemoryImportTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next executions fail with `errors`, one per execution.
    pub async fn fail_next(&self, errors: impl IntoIterator<Item = ScalingError>) {
        self.inner.lock().await.failures.extend(errors);
    }

    /// Returns the row of `table` whose `column` holds `value`.
    pub async fn find_row(&self, table: &str, column: &str, value: &Cell) -> Option<Row> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)?
            .values()
            .find(|row| row.get(column) == Some(value))
            .cloned()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or_default()
    }

    pub async fn executed_sql(&self) -> Vec<String> {
        self.inner.lock().await.executed_sql.clone()
    }

    /// Number of execute calls, failed ones included.
    pub async fn executions(&self) -> usize {
        self.inner.lock().await.executions
    }

    /// Registers a notification that fires once `table` holds `count` rows.
    pub async fn notify_on_row_count(&self, table: &str, count: usize) -> TimedNotify {
        let table = table.to_string();
        let notify = Arc::new(Notify::new());

        let mut inner = self.inner.lock().await;
        inner.conditions.push((
            Box::new(move |tables| tables.get(&table).map_or(0, BTreeMap::len) == count),
            notify.clone(),
        ));
        inner.check_conditions();

        TimedNotify::new(notify)
    }
}

fn render_key(keys: &[(String, Cell)]) -> String {
    keys.iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn apply(tables: &mut Tables, keyless_inserts: &mut u64, statement: &SqlStatement) -> u64 {
    let rows = tables.entry(statement.table.clone()).or_default();

    if statement.keys.is_empty() {
        if statement.operation != Operation::Insert {
            return 0;
        }
        *keyless_inserts += 1;
        rows.insert(
            format!("#{keyless_inserts}"),
            statement.columns.iter().cloned().collect(),
        );
        return 1;
    }

    let key = render_key(&statement.keys);
    match statement.operation {
        Operation::Insert => {
            rows.insert(key, statement.columns.iter().cloned().collect());
            1
        }
        Operation::Update => {
            let Some(mut row) = rows.remove(&key) else {
                return 0;
            };
            for (name, value) in &statement.columns {
                row.insert(name.clone(), value.clone());
            }

            // A changed key moves the row.
            let new_key = statement
                .keys
                .iter()
                .map(|(name, _)| {
                    let value = row.get(name).cloned().unwrap_or(Cell::Null);
                    (name.clone(), value)
                })
                .collect::<Vec<_>>();
            rows.insert(render_key(&new_key), row);
            1
        }
        Operation::Delete => u64::from(rows.remove(&key).is_some()),
    }
}

impl ImportTarget for MemoryImportTarget {
    async fn execute(&self, statements: &[SqlStatement]) -> ScalingResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.executions += 1;
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }

        let mut tables = inner.tables.clone();
        let mut keyless_inserts = inner.keyless_inserts;
        let affected: u64 = statements
            .iter()
            .map(|statement| apply(&mut tables, &mut keyless_inserts, statement))
            .sum();

        inner.tables = tables;
        inner.keyless_inserts = keyless_inserts;
        inner
            .executed_sql
            .extend(statements.iter().map(|statement| statement.sql.clone()));
        inner.check_conditions();
        drop(inner);

        debug!(
            statements = statements.len(),
            affected, "memory target applied statements"
        );

        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(keys: Vec<(String, Cell)>, columns: Vec<(String, Cell)>) -> SqlStatement {
        SqlStatement {
            sql: "INSERT INTO t_order".to_string(),
            params: Vec::new(),
            operation: Operation::Insert,
            schema: None,
            table: "t_order".to_string(),
            columns,
            keys,
        }
    }

    #[tokio::test]
    async fn keyed_inserts_replace_and_keyless_inserts_append() {
        let target = MemoryImportTarget::new();
        let keyed = insert(
            vec![("order_id".to_string(), Cell::I64(1))],
            vec![
                ("order_id".to_string(), Cell::I64(1)),
                ("status".to_string(), Cell::from("NEW")),
            ],
        );
        let keyless = insert(Vec::new(), vec![("status".to_string(), Cell::from("NEW"))]);

        target.execute(&[keyed.clone(), keyed]).await.unwrap();
        assert_eq!(target.row_count("t_order").await, 1);

        assert_eq!(
            target
                .execute(&[keyless.clone(), keyless.clone()])
                .await
                .unwrap(),
            2
        );
        target.execute(&[keyless]).await.unwrap();
        assert_eq!(target.row_count("t_order").await, 4);
    }
}
