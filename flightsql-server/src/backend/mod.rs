//! `SqlBackend`: the out-of-scope collaborator the dispatcher routes to
//! (`spec.md` §1, §4.3). Modeled as a capability interface rather than a
//! trait with default `NotImplemented` overrides, per the redesign note
//! in `spec.md` §9 — a backend registers exactly what it supports via
//! [`BackendCapabilities`], and the dispatcher (not this trait) reads
//! that flag set to decide whether to route a metadata command to the
//! backend at all or answer `NotImplemented` itself without calling in.

pub mod datafusion;

use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use flightsql_protocol::catalog::{SqlInfoValue, TableRef};
use flightsql_protocol::error::FlightSqlError;

/// Bit flags a backend sets to advertise which optional operations it
/// supports. Required operations (ad-hoc query, prepared statement
/// lifecycle, catalog listing) have no bit: every backend must
/// implement them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub updates: bool,
    pub primary_keys: bool,
    pub imported_keys: bool,
    pub exported_keys: bool,
    pub cross_reference: bool,
}

/// The output of executing a query or a prepared statement: the result
/// schema plus a stream of batches conforming to it. Returned eagerly
/// (no open cursor held server-side) because the result is immediately
/// handed to `FlightDataEncoderBuilder`.
pub struct QueryResult {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

/// A capability interface a SQL engine implements once to back the
/// dispatcher. All methods are `async` because a real backend talks to
/// storage; the reference implementation in [`datafusion`] happens to
/// resolve most of these synchronously.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities;

    /// Execute ad-hoc or prepared-statement SQL text and return the
    /// full result. `parameters`, when `Some`, is the uploaded
    /// parameter batch for a prepared statement with a non-empty
    /// parameter schema.
    async fn execute_query(
        &self,
        sql: &str,
        parameters: Option<&RecordBatch>,
    ) -> Result<QueryResult, FlightSqlError>;

    /// Execute an ad-hoc or prepared UPDATE/INSERT/DELETE statement,
    /// returning the number of affected rows. A backend that cannot
    /// determine the count may return a negative value; the dispatcher
    /// passes it through unchanged (`DESIGN.md` resolves the open
    /// question in `spec.md` §9).
    async fn execute_update(
        &self,
        sql: &str,
        parameters: Option<&RecordBatch>,
    ) -> Result<i64, FlightSqlError>;

    /// Resolve the parameter schema a prepared statement expects, or
    /// an empty schema if the statement takes no parameters.
    async fn prepare(&self, sql: &str) -> Result<PreparedQueryInfo, FlightSqlError>;

    /// Release any backend-side resources associated with a prepared
    /// statement handle. Called by the prepared-statement cache's
    /// eviction listener and by an explicit `ClosePreparedStatement`
    /// action; must be idempotent.
    async fn close_prepared(&self, sql: &str);

    async fn list_catalogs(&self) -> Result<Vec<String>, FlightSqlError>;

    async fn list_schemas(
        &self,
        catalog: Option<&str>,
        schema_filter_pattern: Option<&str>,
    ) -> Result<Vec<(Option<String>, String)>, FlightSqlError>;

    async fn list_tables(
        &self,
        catalog: Option<&str>,
        schema_filter_pattern: Option<&str>,
        table_name_filter_pattern: Option<&str>,
        table_types: &[String],
    ) -> Result<Vec<TableInfo>, FlightSqlError>;

    async fn sql_info(&self, codes: &[u32]) -> Result<Vec<(u32, SqlInfoValue)>, FlightSqlError>;

    /// Only called by the dispatcher when `capabilities().primary_keys`
    /// is set; a backend that sets the flag must implement this for
    /// real rather than falling back to a stub.
    async fn primary_keys(&self, table: &TableRef) -> Result<Vec<PrimaryKeyRow>, FlightSqlError>;

    /// Only called when `capabilities().imported_keys` is set.
    async fn imported_keys(&self, table: &TableRef) -> Result<Vec<KeyReferenceRow>, FlightSqlError>;

    /// Only called when `capabilities().exported_keys` is set.
    async fn exported_keys(&self, table: &TableRef) -> Result<Vec<KeyReferenceRow>, FlightSqlError>;

    /// Only called when `capabilities().cross_reference` is set.
    async fn cross_reference(
        &self,
        pk_table: &TableRef,
        fk_table: &TableRef,
    ) -> Result<Vec<KeyReferenceRow>, FlightSqlError>;
}

pub type SharedBackend = Arc<dyn SqlBackend>;

#[derive(Clone, Debug)]
pub struct PreparedQueryInfo {
    pub dataset_schema: SchemaRef,
    pub parameter_schema: SchemaRef,
}

#[derive(Clone, Debug)]
pub struct TableInfo {
    pub table_ref: TableRef,
    pub table_type: String,
    pub schema: SchemaRef,
}

#[derive(Clone, Debug)]
pub struct PrimaryKeyRow {
    pub column_name: String,
    pub key_name: Option<String>,
    pub key_sequence: i32,
}

#[derive(Clone, Debug)]
pub struct KeyReferenceRow {
    pub pk_table: TableRef,
    pub pk_column: String,
    pub fk_table: TableRef,
    pub fk_column: String,
    pub key_sequence: i32,
    pub fk_key_name: Option<String>,
    pub pk_key_name: Option<String>,
    pub update_rule: u8,
    pub delete_rule: u8,
}
