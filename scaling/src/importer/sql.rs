use std::sync::Arc;

use pg_escape::quote_identifier;

use crate::error::{ErrorKind, ScalingResult};
use crate::importer::dialect::ImporterDialect;
use crate::scaling_error;
use crate::types::{Cell, Column, DataRecord, DatabaseType, Operation};

/// A parameterized statement that applies one record, together with its structured form.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    /// Values bound to the placeholders of `sql`, in order.
    pub params: Vec<Cell>,
    pub operation: Operation,
    pub schema: Option<String>,
    pub table: String,
    /// Columns written by the statement with their new values. Empty for DELETE.
    pub columns: Vec<(String, Cell)>,
    /// Unique key columns with the values that identify the target row.
    pub keys: Vec<(String, Cell)>,
}

/// Generates the statements that apply records to one target.
///
/// INSERT becomes an upsert keyed by the unique key columns, so replaying a record is harmless.
/// UPDATE and DELETE match on the before image of the unique key and change nothing when the row
/// is gone. Records without a unique key are rejected for every operation.
#[derive(Debug, Clone)]
pub struct SqlBuilder {
    dialect: Arc<dyn ImporterDialect>,
}

impl SqlBuilder {
    pub fn new(dialect: Arc<dyn ImporterDialect>) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &Arc<dyn ImporterDialect> {
        &self.dialect
    }

    pub fn build(&self, record: &DataRecord) -> ScalingResult<SqlStatement> {
        match record.operation {
            Operation::Insert => self.build_upsert(record),
            Operation::Update => self.build_update(record),
            Operation::Delete => self.build_delete(record),
        }
    }

    fn build_upsert(&self, record: &DataRecord) -> ScalingResult<SqlStatement> {
        let columns = after_image(&record.columns);
        let keys: Vec<(String, Cell)> = record
            .unique_key_columns()
            .map(|column| (column.name.clone(), column.value.clone()))
            .collect();
        // A plain INSERT would duplicate the row on every replay.
        if keys.is_empty() {
            return Err(scaling_error!(
                ErrorKind::InvalidData,
                "Inserted row has no unique key to upsert on",
                format!("{} on {}", record.operation, record.data_node)
            ));
        }

        let mut placeholders = Placeholders::new(self.dialect.database_type());
        let names = columns
            .iter()
            .map(|(name, _)| self.quote(name))
            .collect::<Vec<_>>()
            .join(", ");
        let values = columns
            .iter()
            .map(|_| placeholders.next_placeholder())
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({names}) VALUES ({values})",
            self.qualified_table(&record.table_name)
        );

        let non_keys = columns
            .iter()
            .filter(|(name, _)| !keys.iter().any(|(key, _)| key == name))
            .map(|(name, _)| self.quote(name))
            .collect::<Vec<_>>();

        match self.dialect.database_type() {
            DatabaseType::MySql | DatabaseType::H2 => {
                // A key-only row still needs an assignment to turn a duplicate into a no-op.
                let assignments = if non_keys.is_empty() {
                    let key = self.quote(&keys[0].0);
                    format!("{key}=VALUES({key})")
                } else {
                    non_keys
                        .iter()
                        .map(|name| format!("{name}=VALUES({name})"))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {assignments}"));
            }
            DatabaseType::PostgreSql | DatabaseType::OpenGauss => {
                let conflict = keys
                    .iter()
                    .map(|(name, _)| self.quote(name))
                    .collect::<Vec<_>>()
                    .join(", ");
                if non_keys.is_empty() {
                    sql.push_str(&format!(" ON CONFLICT ({conflict}) DO NOTHING"));
                } else {
                    let assignments = non_keys
                        .iter()
                        .map(|name| format!("{name}=EXCLUDED.{name}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(
                        " ON CONFLICT ({conflict}) DO UPDATE SET {assignments}"
                    ));
                }
            }
        }

        Ok(SqlStatement {
            sql,
            params: columns.iter().map(|(_, value)| value.clone()).collect(),
            operation: Operation::Insert,
            schema: self.dialect.schema_name(&record.table_name),
            table: record.table_name.clone(),
            columns,
            keys,
        })
    }

    fn build_update(&self, record: &DataRecord) -> ScalingResult<SqlStatement> {
        let keys = self.match_keys(record)?;

        let mut columns: Vec<(String, Cell)> = record
            .columns
            .iter()
            .filter(|column| column.updated)
            .map(|column| (column.name.clone(), column.value.clone()))
            .collect();
        if columns.is_empty() {
            columns = after_image(&record.columns);
        }

        let mut placeholders = Placeholders::new(self.dialect.database_type());
        let assignments = columns
            .iter()
            .map(|(name, _)| format!("{}={}", self.quote(name), placeholders.next_placeholder()))
            .collect::<Vec<_>>()
            .join(", ");
        let condition = self.condition(&keys, &mut placeholders);

        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {condition}",
            self.qualified_table(&record.table_name)
        );

        let params = columns
            .iter()
            .chain(keys.iter())
            .map(|(_, value)| value.clone())
            .collect();

        Ok(SqlStatement {
            sql,
            params,
            operation: Operation::Update,
            schema: self.dialect.schema_name(&record.table_name),
            table: record.table_name.clone(),
            columns,
            keys,
        })
    }

    fn build_delete(&self, record: &DataRecord) -> ScalingResult<SqlStatement> {
        let keys = self.match_keys(record)?;

        let mut placeholders = Placeholders::new(self.dialect.database_type());
        let condition = self.condition(&keys, &mut placeholders);
        let sql = format!(
            "DELETE FROM {} WHERE {condition}",
            self.qualified_table(&record.table_name)
        );

        Ok(SqlStatement {
            sql,
            params: keys.iter().map(|(_, value)| value.clone()).collect(),
            operation: Operation::Delete,
            schema: self.dialect.schema_name(&record.table_name),
            table: record.table_name.clone(),
            columns: Vec::new(),
            keys,
        })
    }

    /// Unique key columns with their before image. A row change without a unique key cannot be
    /// applied safely.
    fn match_keys(&self, record: &DataRecord) -> ScalingResult<Vec<(String, Cell)>> {
        let keys: Vec<(String, Cell)> = record
            .unique_key_columns()
            .map(|column| (column.name.clone(), column.key_value().clone()))
            .collect();

        if keys.is_empty() {
            return Err(scaling_error!(
                ErrorKind::InvalidData,
                "Row change has no unique key to match on",
                format!("{} on {}", record.operation, record.data_node)
            ));
        }

        Ok(keys)
    }

    fn condition(&self, keys: &[(String, Cell)], placeholders: &mut Placeholders) -> String {
        keys.iter()
            .map(|(name, _)| format!("{}={}", self.quote(name), placeholders.next_placeholder()))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn qualified_table(&self, table: &str) -> String {
        match self.dialect.schema_name(table) {
            Some(schema) => format!("{}.{}", self.quote(&schema), self.quote(table)),
            None => self.quote(table),
        }
    }

    fn quote(&self, identifier: &str) -> String {
        match self.dialect.database_type() {
            DatabaseType::MySql | DatabaseType::H2 => {
                format!("`{}`", identifier.replace('`', "``"))
            }
            DatabaseType::PostgreSql | DatabaseType::OpenGauss => {
                quote_identifier(identifier).into_owned()
            }
        }
    }
}

fn after_image(columns: &[Column]) -> Vec<(String, Cell)> {
    columns
        .iter()
        .map(|column| (column.name.clone(), column.value.clone()))
        .collect()
}

/// Numbers placeholders the way the target's driver expects.
struct Placeholders {
    numbered: bool,
    next: usize,
}

impl Placeholders {
    fn new(database_type: DatabaseType) -> Self {
        Self {
            numbered: database_type.is_schema_aware(),
            next: 1,
        }
    }

    fn next_placeholder(&mut self) -> String {
        let index = self.next;
        self.next += 1;

        if self.numbered {
            format!("${index}")
        } else {
            "?".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::dialect::{MySqlDialect, OpenGaussDialect, PostgreSqlDialect};
    use crate::types::{DataNode, Position, StreamPosition};

    fn record(operation: Operation, columns: Vec<Column>) -> DataRecord {
        DataRecord {
            data_node: DataNode::new("ds0", "t_order_0"),
            table_name: "t_order".to_string(),
            operation,
            columns,
            position: Position::Stream(StreamPosition::new("binlog.000001:4")),
        }
    }

    fn order_columns() -> Vec<Column> {
        vec![
            Column::new("order_id", 1i64, true),
            Column::new("status", "OK", false),
        ]
    }

    #[test]
    fn mysql_insert_is_an_upsert_without_schema() {
        let builder = SqlBuilder::new(Arc::new(MySqlDialect));
        let statement = builder
            .build(&record(Operation::Insert, order_columns()))
            .unwrap();

        assert_eq!(
            statement.sql,
            "INSERT INTO `t_order` (`order_id`, `status`) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE `status`=VALUES(`status`)"
        );
        assert_eq!(statement.schema, None);
        assert_eq!(statement.params, vec![Cell::I64(1), Cell::from("OK")]);
    }

    #[test]
    fn postgres_insert_conflicts_on_the_unique_key() {
        let builder = SqlBuilder::new(Arc::new(PostgreSqlDialect::default()));
        let statement = builder
            .build(&record(Operation::Insert, order_columns()))
            .unwrap();

        assert_eq!(
            statement.sql,
            "INSERT INTO public.t_order (order_id, status) VALUES ($1, $2) \
             ON CONFLICT (order_id) DO UPDATE SET status=EXCLUDED.status"
        );
        assert_eq!(statement.schema.as_deref(), Some("public"));
    }

    #[test]
    fn update_matches_on_the_before_image() {
        let builder = SqlBuilder::new(Arc::new(OpenGaussDialect::new("sharding")));
        let mut columns = order_columns();
        columns[0] = Column::new("order_id", 2i64, true).with_old_value(1i64);
        columns[1].updated = false;

        let statement = builder.build(&record(Operation::Update, columns)).unwrap();

        assert_eq!(
            statement.sql,
            "UPDATE sharding.t_order SET order_id=$1 WHERE order_id=$2"
        );
        assert_eq!(statement.params, vec![Cell::I64(2), Cell::I64(1)]);
        assert_eq!(statement.keys, vec![("order_id".to_string(), Cell::I64(1))]);
    }

    #[test]
    fn delete_matches_on_the_unique_key() {
        let builder = SqlBuilder::new(Arc::new(MySqlDialect));
        let statement = builder
            .build(&record(Operation::Delete, order_columns()))
            .unwrap();

        assert_eq!(statement.sql, "DELETE FROM `t_order` WHERE `order_id`=?");
        assert!(statement.columns.is_empty());
    }

    #[test]
    fn row_changes_without_a_unique_key_are_rejected() {
        let builder = SqlBuilder::new(Arc::new(MySqlDialect));
        let columns = vec![Column::new("status", "OK", false)];

        for operation in [Operation::Insert, Operation::Update, Operation::Delete] {
            let err = builder
                .build(&record(operation, columns.clone()))
                .unwrap_err();

            assert_eq!(err.kind(), ErrorKind::InvalidData, "{operation}");
        }
    }

    #[test]
    fn identifiers_are_quoted_per_dialect() {
        let mysql = SqlBuilder::new(Arc::new(MySqlDialect));
        let postgres = SqlBuilder::new(Arc::new(PostgreSqlDialect::default()));

        assert_eq!(mysql.quote("we`ird"), "`we``ird`");
        assert_eq!(postgres.quote("Order"), "\"Order\"");
    }
}
