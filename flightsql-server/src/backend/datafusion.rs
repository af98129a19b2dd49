//! Reference `SqlBackend` built on DataFusion's embedded SQL engine.
//!
//! This is a collaborator, not part of the protocol core (`spec.md`
//! §1): it exists so the dispatcher is runnable and testable, seeded
//! with the `intTable`/`foreignTable` fixture `spec.md` §8 uses for its
//! end-to-end scenarios. A production deployment would swap this for a
//! backend talking to a real engine.

use std::sync::Arc;

use arrow_array::{ArrayRef, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use flightsql_protocol::catalog::{SqlInfoValue, TableRef};
use flightsql_protocol::error::FlightSqlError;
use flightsql_protocol::sql_info;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{
    BackendCapabilities, KeyReferenceRow, PreparedQueryInfo, PrimaryKeyRow, QueryResult,
    SqlBackend, TableInfo,
};

#[derive(Clone)]
struct Row {
    id: i32,
    key_name: Option<String>,
    value: Option<i32>,
    foreign_id: Option<i32>,
}

fn int_table_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ID", DataType::Int32, false),
        Field::new("KEYNAME", DataType::Utf8, true),
        Field::new("VALUE", DataType::Int32, true),
        Field::new("FOREIGNID", DataType::Int32, true),
    ]))
}

fn foreign_table_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ID", DataType::Int32, false),
        Field::new("FOREIGNNAME", DataType::Utf8, false),
        Field::new("VALUE", DataType::Int32, true),
    ]))
}

fn rows_to_batch(schema: SchemaRef, rows: &[Row]) -> RecordBatch {
    let ids: Int32Array = rows.iter().map(|r| Some(r.id)).collect();
    let key_names: StringArray = rows.iter().map(|r| r.key_name.as_deref()).collect();
    let values: Int32Array = rows.iter().map(|r| r.value).collect();
    let foreign_ids: Int32Array = rows.iter().map(|r| r.foreign_id).collect();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids) as ArrayRef,
            Arc::new(key_names) as ArrayRef,
            Arc::new(values) as ArrayRef,
            Arc::new(foreign_ids) as ArrayRef,
        ],
    )
    .expect("fixed four-column int_table schema")
}

/// A SQL backend over two in-memory tables, matching `spec.md` §8's
/// fixture exactly. Ad-hoc and prepared query text is run through a
/// fresh DataFusion `SessionContext` re-registered against the current
/// row store on every call; updates are interpreted by a small
/// hand-rolled parser limited to the literal insert/delete shapes the
/// fixture exercises (full DML parsing is outside this reference
/// backend's job).
pub struct DataFusionBackend {
    int_table: RwLock<Vec<Row>>,
    foreign_table: Vec<Row>,
}

impl DataFusionBackend {
    pub fn new() -> Self {
        let int_table = vec![
            Row {
                id: 1,
                key_name: Some("one".to_string()),
                value: Some(1),
                foreign_id: Some(1),
            },
            Row {
                id: 2,
                key_name: Some("zero".to_string()),
                value: Some(0),
                foreign_id: Some(1),
            },
            Row {
                id: 3,
                key_name: Some("negative one".to_string()),
                value: Some(-1),
                foreign_id: Some(1),
            },
        ];
        let foreign_table = vec![Row {
            id: 1,
            key_name: None,
            value: Some(100),
            foreign_id: None,
        }];
        Self {
            int_table: RwLock::new(int_table),
            foreign_table,
        }
    }

    async fn session_context(&self) -> Result<SessionContext, FlightSqlError> {
        let ctx = SessionContext::new();
        let int_rows = self.int_table.read().clone();
        let int_batch = rows_to_batch(int_table_schema(), &int_rows);
        let int_provider = MemTable::try_new(int_table_schema(), vec![vec![int_batch]])
            .map_err(df_err)?;
        ctx.register_table("inttable", Arc::new(int_provider))
            .map_err(df_err)?;

        let foreign_batch = foreign_rows_to_batch(&self.foreign_table);
        let foreign_provider =
            MemTable::try_new(foreign_table_schema(), vec![vec![foreign_batch]]).map_err(df_err)?;
        ctx.register_table("foreigntable", Arc::new(foreign_provider))
            .map_err(df_err)?;
        Ok(ctx)
    }
}

impl Default for DataFusionBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn foreign_rows_to_batch(rows: &[Row]) -> RecordBatch {
    let ids: Int32Array = rows.iter().map(|r| Some(r.id)).collect();
    let names: StringArray = rows
        .iter()
        .map(|r| r.key_name.as_deref().unwrap_or("foreign"))
        .map(Some)
        .collect();
    let values: Int32Array = rows.iter().map(|r| r.value).collect();
    RecordBatch::try_new(
        foreign_table_schema(),
        vec![
            Arc::new(ids) as ArrayRef,
            Arc::new(names) as ArrayRef,
            Arc::new(values) as ArrayRef,
        ],
    )
    .expect("fixed three-column foreign_table schema")
}

fn df_err(err: datafusion::error::DataFusionError) -> FlightSqlError {
    FlightSqlError::BackendError {
        message: err.to_string(),
        sqlstate: None,
    }
}

#[async_trait]
impl SqlBackend for DataFusionBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            updates: true,
            primary_keys: true,
            imported_keys: true,
            exported_keys: true,
            cross_reference: true,
        }
    }

    async fn execute_query(
        &self,
        sql: &str,
        parameters: Option<&RecordBatch>,
    ) -> Result<QueryResult, FlightSqlError> {
        if parameters.is_some() {
            debug!("ignoring parameter batch: reference backend has no parameterized queries");
        }
        info!(sql, "execute_query");
        let ctx = self.session_context().await?;
        let df = ctx.sql(sql).await.map_err(df_err)?;
        let schema = Arc::new(df.schema().as_arrow().clone());
        let batches = df.collect().await.map_err(df_err)?;
        Ok(QueryResult { schema, batches })
    }

    async fn execute_update(
        &self,
        sql: &str,
        _parameters: Option<&RecordBatch>,
    ) -> Result<i64, FlightSqlError> {
        info!(sql, "execute_update");
        if let Some(values) = parse_insert_into_inttable(sql) {
            let mut table = self.int_table.write();
            let mut next_id = table.iter().map(|r| r.id).max().unwrap_or(0) + 1;
            let count = values.len() as i64;
            for (key_name, value) in values {
                table.push(Row {
                    id: next_id,
                    key_name: Some(key_name),
                    value: Some(value),
                    foreign_id: None,
                });
                next_id += 1;
            }
            return Ok(count);
        }
        if let Some(key_names) = parse_delete_from_inttable(sql) {
            let mut table = self.int_table.write();
            let before = table.len();
            table.retain(|row| {
                !row.key_name
                    .as_deref()
                    .map(|k| key_names.iter().any(|target| target == k))
                    .unwrap_or(false)
            });
            return Ok((before - table.len()) as i64);
        }
        Err(FlightSqlError::BackendError {
            message: format!("unsupported update statement: {sql}"),
            sqlstate: None,
        })
    }

    async fn prepare(&self, sql: &str) -> Result<PreparedQueryInfo, FlightSqlError> {
        let ctx = self.session_context().await?;
        let df = ctx.sql(sql).await.map_err(df_err)?;
        let dataset_schema = Arc::new(df.schema().as_arrow().clone());
        Ok(PreparedQueryInfo {
            dataset_schema,
            parameter_schema: Arc::new(Schema::empty()),
        })
    }

    async fn close_prepared(&self, sql: &str) {
        debug!(sql, "close_prepared: no server-side cursor to release");
    }

    async fn list_catalogs(&self) -> Result<Vec<String>, FlightSqlError> {
        Ok(vec![])
    }

    async fn list_schemas(
        &self,
        catalog: Option<&str>,
        schema_filter_pattern: Option<&str>,
    ) -> Result<Vec<(Option<String>, String)>, FlightSqlError> {
        if catalog.is_some() {
            return Ok(vec![]);
        }
        match schema_filter_pattern {
            Some(pattern) if pattern != "APP" && !pattern.is_empty() => Ok(vec![]),
            _ => Ok(vec![(None, "APP".to_string())]),
        }
    }

    async fn list_tables(
        &self,
        catalog: Option<&str>,
        schema_filter_pattern: Option<&str>,
        table_name_filter_pattern: Option<&str>,
        table_types: &[String],
    ) -> Result<Vec<TableInfo>, FlightSqlError> {
        if catalog.is_some() {
            return Ok(vec![]);
        }
        if let Some(pattern) = schema_filter_pattern {
            if pattern != "APP" && !pattern.is_empty() {
                return Ok(vec![]);
            }
        }
        if !table_types.is_empty() && !table_types.iter().any(|t| t == "TABLE") {
            return Ok(vec![]);
        }
        let mut tables = vec![
            TableInfo {
                table_ref: TableRef::new(None, Some("APP".to_string()), "FOREIGNTABLE"),
                table_type: "TABLE".to_string(),
                schema: foreign_table_schema(),
            },
            TableInfo {
                table_ref: TableRef::new(None, Some("APP".to_string()), "INTTABLE"),
                table_type: "TABLE".to_string(),
                schema: int_table_schema(),
            },
        ];
        if let Some(pattern) = table_name_filter_pattern {
            tables.retain(|t| t.table_ref.table == pattern);
        }
        Ok(tables)
    }

    async fn sql_info(&self, codes: &[u32]) -> Result<Vec<(u32, SqlInfoValue)>, FlightSqlError> {
        Ok(codes
            .iter()
            .filter_map(|&code| {
                let value = match code {
                    sql_info::FLIGHT_SQL_SERVER_NAME => {
                        SqlInfoValue::Utf8("flightsql-engine reference server".to_string())
                    }
                    sql_info::FLIGHT_SQL_SERVER_VERSION => {
                        SqlInfoValue::Utf8(env!("CARGO_PKG_VERSION").to_string())
                    }
                    sql_info::FLIGHT_SQL_SERVER_ARROW_VERSION => SqlInfoValue::Utf8("1.3".to_string()),
                    sql_info::FLIGHT_SQL_SERVER_READ_ONLY => SqlInfoValue::Int32(0),
                    sql_info::SQL_DDL_CATALOG => SqlInfoValue::Int32(0),
                    sql_info::SQL_DDL_SCHEMA => SqlInfoValue::Int32(0),
                    sql_info::SQL_DDL_TABLE => SqlInfoValue::Int32(0),
                    sql_info::SQL_IDENTIFIER_CASE => SqlInfoValue::Int32(2),
                    sql_info::SQL_IDENTIFIER_QUOTE_CHAR => SqlInfoValue::Utf8("\"".to_string()),
                    sql_info::SQL_QUOTED_IDENTIFIER_CASE => SqlInfoValue::Int32(1),
                    sql_info::SQL_TRANSACTIONS_SUPPORTED => SqlInfoValue::Int32(0),
                    sql_info::SQL_BATCH_UPDATES_SUPPORTED => SqlInfoValue::Int32(1),
                    _ => return None,
                };
                Some((code, value))
            })
            .collect())
    }

    async fn primary_keys(&self, table: &TableRef) -> Result<Vec<PrimaryKeyRow>, FlightSqlError> {
        if table.table != "INTTABLE" {
            return Ok(vec![]);
        }
        Ok(vec![PrimaryKeyRow {
            column_name: "ID".to_string(),
            key_name: Some("INTTABLE_PK".to_string()),
            key_sequence: 1,
        }])
    }

    async fn imported_keys(&self, table: &TableRef) -> Result<Vec<KeyReferenceRow>, FlightSqlError> {
        if table.table != "INTTABLE" {
            return Ok(vec![]);
        }
        Ok(vec![int_foreign_key_row()])
    }

    async fn exported_keys(&self, table: &TableRef) -> Result<Vec<KeyReferenceRow>, FlightSqlError> {
        if table.table != "FOREIGNTABLE" {
            return Ok(vec![]);
        }
        Ok(vec![int_foreign_key_row()])
    }

    async fn cross_reference(
        &self,
        pk_table: &TableRef,
        fk_table: &TableRef,
    ) -> Result<Vec<KeyReferenceRow>, FlightSqlError> {
        if pk_table.table != "FOREIGNTABLE" || fk_table.table != "INTTABLE" {
            return Ok(vec![]);
        }
        Ok(vec![int_foreign_key_row()])
    }
}

fn int_foreign_key_row() -> KeyReferenceRow {
    KeyReferenceRow {
        pk_table: TableRef::new(None, Some("APP".to_string()), "FOREIGNTABLE"),
        pk_column: "ID".to_string(),
        fk_table: TableRef::new(None, Some("APP".to_string()), "INTTABLE"),
        fk_column: "FOREIGNID".to_string(),
        key_sequence: 1,
        fk_key_name: Some("INTTABLE_FOREIGNID_FK".to_string()),
        pk_key_name: Some("FOREIGNTABLE_PK".to_string()),
        update_rule: 3,
        delete_rule: 3,
    }
}

/// Recognizes `INSERT INTO INTTABLE (keyName, value) VALUES ('A',1), ...`
/// case-insensitively. Returns `(key_name, value)` pairs in source order.
fn parse_insert_into_inttable(sql: &str) -> Option<Vec<(String, i32)>> {
    let upper = sql.to_ascii_uppercase();
    if !upper.trim_start().starts_with("INSERT INTO INTTABLE") {
        return None;
    }
    let values_idx = upper.find("VALUES")?;
    let values_part = &sql[values_idx + "VALUES".len()..];
    let mut rows = Vec::new();
    for group in values_part.split("),") {
        let group = group.trim().trim_start_matches('(').trim_end_matches([')', ';']).trim();
        let mut parts = group.splitn(2, ',');
        let key_name = parts.next()?.trim().trim_matches('\'').to_string();
        let value: i32 = parts.next()?.trim().parse().ok()?;
        rows.push((key_name, value));
    }
    Some(rows)
}

/// Recognizes `DELETE FROM INTTABLE WHERE keyName IN ('A','B','C')`
/// case-insensitively. Returns the matched key names.
fn parse_delete_from_inttable(sql: &str) -> Option<Vec<String>> {
    let upper = sql.to_ascii_uppercase();
    if !upper.trim_start().starts_with("DELETE FROM INTTABLE") {
        return None;
    }
    let in_idx = upper.find(" IN ")?;
    let list_start = sql[in_idx..].find('(')? + in_idx;
    let list_end = sql[list_start..].find(')')? + list_start;
    let list = &sql[list_start + 1..list_end];
    Some(
        list.split(',')
            .map(|s| s.trim().trim_matches('\'').to_string())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_row_insert() {
        let rows = parse_insert_into_inttable(
            "INSERT INTO INTTABLE (keyName, value) VALUES ('A',1),('B',2),('C',3)",
        )
        .unwrap();
        assert_eq!(
            rows,
            vec![
                ("A".to_string(), 1),
                ("B".to_string(), 2),
                ("C".to_string(), 3),
            ]
        );
    }

    #[test]
    fn parses_delete_in_list() {
        let keys =
            parse_delete_from_inttable("DELETE FROM INTTABLE WHERE keyName IN ('A','B','C')")
                .unwrap();
        assert_eq!(keys, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    }

    #[tokio::test]
    async fn insert_then_delete_round_trips_to_original_row_count() {
        let backend = DataFusionBackend::new();
        let inserted = backend
            .execute_update("INSERT INTO INTTABLE (keyName, value) VALUES ('A',1),('B',2),('C',3)", None)
            .await
            .unwrap();
        assert_eq!(inserted, 3);
        let deleted = backend
            .execute_update("DELETE FROM INTTABLE WHERE keyName IN ('A','B','C')", None)
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(backend.int_table.read().len(), 3);
    }

    #[tokio::test]
    async fn query_fixture_matches_spec_scenario() {
        let backend = DataFusionBackend::new();
        let result = backend
            .execute_query("SELECT * FROM intTable", None)
            .await
            .unwrap();
        let total_rows: usize = result.batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total_rows, 3);
    }
}
