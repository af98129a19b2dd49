//! A prepared-statement handle object, generalizing the bind/execute
//! cycle the pack's own Flight SQL client
//! (`128e7cc2_mbrasil-arrow-flight-sql-client`) builds around a
//! `PreparedStatement` wrapper rather than exposing raw handle bytes
//! to callers.

use arrow_array::RecordBatch;
use arrow_flight::FlightInfo;
use arrow_schema::SchemaRef;
use flightsql_protocol::envelope::CommandPreparedStatementQuery;
use flightsql_protocol::error::FlightSqlError;

use crate::client::Client;

pub struct PreparedStatement {
    client: Client,
    handle: Vec<u8>,
    dataset_schema: SchemaRef,
    parameter_schema: SchemaRef,
    closed: bool,
}

impl PreparedStatement {
    pub(crate) fn new(
        client: Client,
        handle: Vec<u8>,
        dataset_schema: SchemaRef,
        parameter_schema: SchemaRef,
    ) -> Self {
        Self {
            client,
            handle,
            dataset_schema,
            parameter_schema,
            closed: false,
        }
    }

    pub fn dataset_schema(&self) -> &SchemaRef {
        &self.dataset_schema
    }

    pub fn parameter_schema(&self) -> &SchemaRef {
        &self.parameter_schema
    }

    /// Bind `parameters` (if any) and run the statement as a query,
    /// returning the `FlightInfo` to follow with `GetStream`.
    pub async fn execute(&mut self, parameters: Option<RecordBatch>) -> Result<FlightInfo, FlightSqlError> {
        self.ensure_open()?;
        let cmd = CommandPreparedStatementQuery {
            prepared_statement_handle: self.handle.clone(),
        };
        self.client.bind_and_execute_query(&cmd, parameters).await
    }

    /// Bind `parameters` (if any) and run the statement as an update,
    /// returning the affected row count.
    pub async fn execute_update(&mut self, parameters: Option<RecordBatch>) -> Result<i64, FlightSqlError> {
        self.ensure_open()?;
        self.client
            .bind_and_execute_update(self.handle.clone(), parameters)
            .await
    }

    /// Convenience combining `execute` with a follow-up `GetStream`,
    /// collecting the whole result into memory.
    pub async fn execute_to_batches(&mut self, parameters: Option<RecordBatch>) -> Result<Vec<RecordBatch>, FlightSqlError> {
        let info = self.execute(parameters).await?;
        self.client.read_all(&info).await
    }

    /// `ClosePreparedStatement`. Idempotent: closing twice is a no-op.
    pub async fn close(mut self) -> Result<(), FlightSqlError> {
        self.close_mut().await
    }

    async fn close_mut(&mut self) -> Result<(), FlightSqlError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.client.close_prepared(self.handle.clone()).await
    }

    fn ensure_open(&self) -> Result<(), FlightSqlError> {
        if self.closed {
            return Err(FlightSqlError::HandleNotFound);
        }
        Ok(())
    }
}
