use arrow_array::RecordBatch;
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::{Action, FlightDescriptor, FlightEndpoint, FlightInfo, IpcMessage, Ticket};
use arrow_schema::Schema;
use futures::StreamExt;
use tonic::transport::Channel;

use flightsql_protocol::envelope::{
    self, ActionClosePreparedStatementRequest, ActionCreatePreparedStatementRequest,
    ActionCreatePreparedStatementResult, CommandGetCatalogs, CommandGetCrossReference,
    CommandGetExportedKeys, CommandGetImportedKeys, CommandGetPrimaryKeys, CommandGetSchemas,
    CommandGetSqlInfo, CommandGetTableTypes, CommandGetTables, CommandPreparedStatementUpdate,
    CommandStatementQuery, CommandStatementUpdate, DoPutUpdateResult, SqlCommand,
    ACTION_CLOSE_PREPARED_STATEMENT, ACTION_CREATE_PREPARED_STATEMENT,
};
use flightsql_protocol::error::FlightSqlError;

use crate::pool::LocationPool;
use crate::prepared_statement::PreparedStatement;

/// Idle channels kept per distinct endpoint `Location`, mirroring the
/// prepared-statement cache's own modest default capacity.
const MAX_IDLE_CHANNELS_PER_LOCATION: usize = 4;

/// A typed Flight SQL client. Thin wrapper over the generated gRPC
/// stub plus the command envelope codec. Holds the channel it was
/// built with for commands answered by this service directly, and a
/// [`LocationPool`] for following a `FlightEndpoint` that names a
/// different `Location` (`spec.md` §4.5).
#[derive(Clone)]
pub struct Client {
    inner: FlightServiceClient<Channel>,
    pool: LocationPool,
}

impl Client {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: FlightServiceClient::new(channel),
            pool: LocationPool::new(MAX_IDLE_CHANNELS_PER_LOCATION),
        }
    }

    /// Borrow the raw stub for verbs this façade does not wrap.
    pub fn inner_mut(&mut self) -> &mut FlightServiceClient<Channel> {
        &mut self.inner
    }

    async fn get_flight_info_for<T: SqlCommand>(&mut self, cmd: &T) -> Result<FlightInfo, FlightSqlError> {
        let descriptor = FlightDescriptor::new_cmd(envelope::pack_bytes(cmd));
        self.inner
            .get_flight_info(descriptor)
            .await
            .map(|r| r.into_inner())
            .map_err(|status| FlightSqlError::from_status(&status))
    }

    /// `Execute` (`spec.md` §4.2): run a query ad hoc, returning the
    /// `FlightInfo` the caller then follows with `DoGet`.
    pub async fn execute(&mut self, query: impl Into<String>) -> Result<FlightInfo, FlightSqlError> {
        let cmd = CommandStatementQuery {
            query: query.into(),
            client_execution_handle: None,
        };
        self.get_flight_info_for(&cmd).await
    }

    /// `ExecuteUpdate`: run an ad-hoc INSERT/UPDATE/DELETE and return
    /// the affected row count.
    pub async fn execute_update(&mut self, query: impl Into<String>) -> Result<i64, FlightSqlError> {
        let cmd = CommandStatementUpdate { query: query.into() };
        let descriptor = FlightDescriptor::new_cmd(envelope::pack_bytes(&cmd));
        self.do_put_expect_update(descriptor, None).await
    }

    pub(crate) async fn do_put_expect_update(
        &mut self,
        descriptor: FlightDescriptor,
        params: Option<RecordBatch>,
    ) -> Result<i64, FlightSqlError> {
        let frames = self.encode_put_frames(descriptor, params).await?;
        let mut response = self
            .inner
            .do_put(futures::stream::iter(frames))
            .await
            .map_err(|status| FlightSqlError::from_status(&status))?
            .into_inner();
        let ack = response
            .message()
            .await
            .map_err(|status| FlightSqlError::from_status(&status))?
            .ok_or_else(|| FlightSqlError::Internal("server closed DoPut without an ack".to_string()))?;
        let any = envelope::unpack_tag(&ack.app_metadata).map_err(FlightSqlError::from)?;
        let result: DoPutUpdateResult = envelope::unpack(&any).map_err(FlightSqlError::from)?;
        Ok(result.record_count)
    }

    pub(crate) async fn encode_put_frames(
        &self,
        descriptor: FlightDescriptor,
        params: Option<RecordBatch>,
    ) -> Result<Vec<arrow_flight::FlightData>, FlightSqlError> {
        let first = arrow_flight::FlightData {
            flight_descriptor: Some(descriptor),
            ..Default::default()
        };
        let mut frames = vec![first];
        if let Some(batch) = params {
            use arrow_flight::encode::FlightDataEncoderBuilder;
            let mut encoder = Box::pin(
                FlightDataEncoderBuilder::new()
                    .with_schema(batch.schema())
                    .build(futures::stream::once(async move { Ok(batch) })),
            );
            while let Some(frame) = encoder.next().await {
                frames.push(frame.map_err(|e| FlightSqlError::Internal(e.to_string()))?);
            }
        }
        Ok(frames)
    }

    /// `Prepare` (`spec.md` §4.2, §4.4): create a server-side prepared
    /// statement and return its handle object.
    pub async fn prepare(&mut self, query: impl Into<String>) -> Result<PreparedStatement, FlightSqlError> {
        let request = ActionCreatePreparedStatementRequest { query: query.into() };
        let action = Action {
            r#type: ACTION_CREATE_PREPARED_STATEMENT.to_string(),
            body: envelope::pack_bytes(&request).into(),
        };
        let mut stream = self
            .inner
            .do_action(action)
            .await
            .map_err(|status| FlightSqlError::from_status(&status))?
            .into_inner();
        let first = stream
            .next()
            .await
            .ok_or_else(|| FlightSqlError::Internal("CreatePreparedStatement returned no result".to_string()))?
            .map_err(|status| FlightSqlError::from_status(&status))?;
        let any = envelope::unpack_tag(&first.body).map_err(FlightSqlError::from)?;
        let result: ActionCreatePreparedStatementResult = envelope::unpack(&any).map_err(FlightSqlError::from)?;

        let dataset_schema = Schema::try_from(IpcMessage(result.dataset_schema.into()))
            .map_err(|e| FlightSqlError::Internal(format!("decoding dataset schema: {e}")))?;
        let parameter_schema = Schema::try_from(IpcMessage(result.parameter_schema.into()))
            .map_err(|e| FlightSqlError::Internal(format!("decoding parameter schema: {e}")))?;

        Ok(PreparedStatement::new(
            self.clone(),
            result.prepared_statement_handle,
            dataset_schema.into(),
            parameter_schema.into(),
        ))
    }

    pub(crate) async fn close_prepared(&mut self, handle: Vec<u8>) -> Result<(), FlightSqlError> {
        let request = ActionClosePreparedStatementRequest {
            prepared_statement_handle: handle,
        };
        let action = Action {
            r#type: ACTION_CLOSE_PREPARED_STATEMENT.to_string(),
            body: envelope::pack_bytes(&request).into(),
        };
        let mut stream = self
            .inner
            .do_action(action)
            .await
            .map_err(|status| FlightSqlError::from_status(&status))?
            .into_inner();
        while stream.next().await.is_some() {}
        Ok(())
    }

    pub async fn get_catalogs(&mut self) -> Result<FlightInfo, FlightSqlError> {
        self.get_flight_info_for(&CommandGetCatalogs {}).await
    }

    pub async fn get_schemas(
        &mut self,
        catalog: Option<String>,
        schema_filter_pattern: Option<String>,
    ) -> Result<FlightInfo, FlightSqlError> {
        let cmd = CommandGetSchemas {
            catalog,
            schema_filter_pattern,
        };
        self.get_flight_info_for(&cmd).await
    }

    pub async fn get_tables(
        &mut self,
        catalog: Option<String>,
        schema_filter_pattern: Option<String>,
        table_name_filter_pattern: Option<String>,
        table_types: Vec<String>,
        include_schema: bool,
    ) -> Result<FlightInfo, FlightSqlError> {
        let cmd = CommandGetTables {
            catalog,
            schema_filter_pattern,
            table_name_filter_pattern,
            table_types,
            include_schema,
        };
        self.get_flight_info_for(&cmd).await
    }

    pub async fn get_table_types(&mut self) -> Result<FlightInfo, FlightSqlError> {
        self.get_flight_info_for(&CommandGetTableTypes {}).await
    }

    pub async fn get_sql_info(&mut self, info: Vec<u32>) -> Result<FlightInfo, FlightSqlError> {
        self.get_flight_info_for(&CommandGetSqlInfo { info }).await
    }

    pub async fn get_primary_keys(
        &mut self,
        catalog: Option<String>,
        schema: Option<String>,
        table: String,
    ) -> Result<FlightInfo, FlightSqlError> {
        let cmd = CommandGetPrimaryKeys { catalog, schema, table };
        self.get_flight_info_for(&cmd).await
    }

    pub async fn get_imported_keys(
        &mut self,
        catalog: Option<String>,
        schema: Option<String>,
        table: String,
    ) -> Result<FlightInfo, FlightSqlError> {
        let cmd = CommandGetImportedKeys { catalog, schema, table };
        self.get_flight_info_for(&cmd).await
    }

    pub async fn get_exported_keys(
        &mut self,
        catalog: Option<String>,
        schema: Option<String>,
        table: String,
    ) -> Result<FlightInfo, FlightSqlError> {
        let cmd = CommandGetExportedKeys { catalog, schema, table };
        self.get_flight_info_for(&cmd).await
    }

    pub async fn get_cross_reference(
        &mut self,
        pk_catalog: Option<String>,
        pk_schema: Option<String>,
        pk_table: String,
        fk_catalog: Option<String>,
        fk_schema: Option<String>,
        fk_table: String,
    ) -> Result<FlightInfo, FlightSqlError> {
        let cmd = CommandGetCrossReference {
            pk_catalog,
            pk_schema,
            pk_table,
            fk_catalog,
            fk_schema,
            fk_table,
        };
        self.get_flight_info_for(&cmd).await
    }

    /// `GetStream`: follow a ticket against this client's own channel
    /// (no `Location` to redirect to) and read the result as decoded
    /// record batches.
    pub async fn get_stream(&mut self, ticket: Ticket) -> Result<FlightRecordBatchStream, FlightSqlError> {
        let stream = self
            .inner
            .do_get(ticket)
            .await
            .map_err(|status| FlightSqlError::from_status(&status))?
            .into_inner();
        Ok(FlightRecordBatchStream::new(stream))
    }

    /// Follow `endpoint`'s ticket, opening a pooled connection to its
    /// first `Location` when it names one (`spec.md` §4.5); an
    /// endpoint with no location means "this same service", so it
    /// reuses the channel this `Client` already holds.
    async fn get_stream_for_endpoint(
        &mut self,
        endpoint: &FlightEndpoint,
        ticket: Ticket,
    ) -> Result<FlightRecordBatchStream, FlightSqlError> {
        match endpoint.location.first() {
            Some(location) if !location.uri.is_empty() => {
                let pooled = self
                    .pool
                    .get(location)
                    .await
                    .map_err(|e| FlightSqlError::Internal(e.to_string()))?;
                let mut endpoint_client = FlightServiceClient::new(pooled.channel().clone());
                drop(pooled);
                let stream = endpoint_client
                    .do_get(ticket)
                    .await
                    .map_err(|status| FlightSqlError::from_status(&status))?
                    .into_inner();
                Ok(FlightRecordBatchStream::new(stream))
            }
            _ => self.get_stream(ticket).await,
        }
    }

    /// Convenience used heavily in tests and by callers that just want
    /// the rows: follow `info`'s first endpoint and collect every
    /// batch.
    pub async fn read_all(&mut self, info: &FlightInfo) -> Result<Vec<RecordBatch>, FlightSqlError> {
        let endpoint = info
            .endpoint
            .first()
            .ok_or_else(|| FlightSqlError::Internal("FlightInfo carries no endpoint".to_string()))?;
        let ticket = endpoint
            .ticket
            .clone()
            .ok_or_else(|| FlightSqlError::Internal("endpoint carries no ticket".to_string()))?;
        let mut stream = self.get_stream_for_endpoint(endpoint, ticket).await?;
        let mut batches = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch.map_err(|e| FlightSqlError::Internal(e.to_string()))?;
            batches.push(batch);
        }
        Ok(batches)
    }

    pub(crate) async fn bind_and_execute_query(
        &mut self,
        cmd: &flightsql_protocol::envelope::CommandPreparedStatementQuery,
        params: Option<RecordBatch>,
    ) -> Result<FlightInfo, FlightSqlError> {
        if let Some(batch) = params {
            let descriptor = FlightDescriptor::new_cmd(envelope::pack_bytes(cmd));
            let frames = self.encode_put_frames(descriptor, Some(batch)).await?;
            let mut response = self
                .inner
                .do_put(futures::stream::iter(frames))
                .await
                .map_err(|status| FlightSqlError::from_status(&status))?
                .into_inner();
            while response
                .message()
                .await
                .map_err(|status| FlightSqlError::from_status(&status))?
                .is_some()
            {}
        }
        self.get_flight_info_for(cmd).await
    }

    pub(crate) async fn bind_and_execute_update(
        &mut self,
        handle: Vec<u8>,
        params: Option<RecordBatch>,
    ) -> Result<i64, FlightSqlError> {
        let cmd = CommandPreparedStatementUpdate {
            prepared_statement_handle: handle,
        };
        let descriptor = FlightDescriptor::new_cmd(envelope::pack_bytes(&cmd));
        self.do_put_expect_update(descriptor, params).await
    }
}
