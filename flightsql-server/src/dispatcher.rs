//! Server dispatcher (`spec.md` §4.3): a message-typed command router
//! built directly on `arrow_flight::flight_service_server::FlightService`,
//! the raw four-verb trait, instead of the crate's `FlightSqlService`
//! convenience trait.
//!
//! Routing is a `match` over `(verb, tag)` pairs rather than a trait
//! with `NotImplemented`-stub default methods (`spec.md` §9): the codec
//! layer yields `(tag, payload)` and this module's handlers each
//! consume their own payload type directly.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::FlightService;
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint, FlightInfo,
    HandshakeRequest, HandshakeResponse, IpcMessage, PollInfo, PutResult, SchemaAsIpc, SchemaResult,
    Ticket,
};
use arrow_ipc::writer::IpcWriteOptions;
use arrow_schema::SchemaRef;
use futures::{Stream, StreamExt, TryStreamExt};
use moka::sync::Cache;
use prost_types::Any;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, instrument};

use flightsql_protocol::catalog;
use flightsql_protocol::envelope::{
    self, ActionClosePreparedStatementRequest, ActionCreatePreparedStatementRequest,
    ActionCreatePreparedStatementResult, CommandGetCatalogs, CommandGetCrossReference,
    CommandGetExportedKeys, CommandGetImportedKeys, CommandGetPrimaryKeys, CommandGetSchemas,
    CommandGetSqlInfo, CommandGetTableTypes, CommandGetTables, CommandPreparedStatementQuery,
    CommandPreparedStatementUpdate, CommandStatementQuery, CommandStatementUpdate,
    DoPutUpdateResult, TicketStatementQuery, ACTION_CLOSE_PREPARED_STATEMENT,
    ACTION_CREATE_PREPARED_STATEMENT,
};
use flightsql_protocol::error::FlightSqlError;
use flightsql_protocol::TableRef;

use crate::backend::SharedBackend;
use crate::prepared::PreparedStatementCache;

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

macro_rules! status {
    ($desc:expr, $err:expr) => {
        Status::internal(format!("{}: {}", $desc, $err))
    };
}

/// Caches the SQL text behind an ad-hoc `CommandStatementQuery`'s
/// execution handle between `GetFlightInfo` and `GetStream`, per
/// `spec.md` §2's data-flow sketch: no server-side cursor is held, the
/// statement text itself travels inside the ticket.
type AdHocStatementCache = Cache<u64, Arc<String>>;

pub struct FlightSqlDispatcher {
    backend: SharedBackend,
    statements: PreparedStatementCache,
    ad_hoc: AdHocStatementCache,
}

impl FlightSqlDispatcher {
    pub fn new(backend: SharedBackend, prepared_capacity: u64, idle_expiry: Duration) -> Self {
        let statements = PreparedStatementCache::new(backend.clone(), prepared_capacity, idle_expiry);
        let ad_hoc = Cache::builder().max_capacity(prepared_capacity).build();
        Self {
            backend,
            statements,
            ad_hoc,
        }
    }

    fn decode_cmd(descriptor: &FlightDescriptor) -> Result<Any, Status> {
        envelope::unpack_tag(&descriptor.cmd).map_err(|e| status!("invalid command envelope", e))
    }

    fn decode_ticket(ticket: &Ticket) -> Result<Any, Status> {
        envelope::unpack_tag(&ticket.ticket).map_err(|e| status!("invalid ticket envelope", e))
    }

    fn schema_ipc_bytes(schema: &arrow_schema::Schema) -> Result<bytes::Bytes, Status> {
        let message: IpcMessage = SchemaAsIpc::new(schema, &IpcWriteOptions::default())
            .try_into()
            .map_err(|e| status!("unable to serialize schema", e))?;
        Ok(message.0)
    }

    fn flight_info(
        descriptor: FlightDescriptor,
        schema: &arrow_schema::Schema,
        ticket_bytes: Vec<u8>,
    ) -> Result<FlightInfo, Status> {
        let endpoint = FlightEndpoint::new().with_ticket(Ticket::new(ticket_bytes));
        FlightInfo::new()
            .try_with_schema(schema)
            .map_err(|e| status!("unable to encode schema", e))
            .map(|info| info.with_endpoint(endpoint).with_descriptor(descriptor))
    }

    fn batches_stream(
        schema: SchemaRef,
        batches: Vec<arrow_array::RecordBatch>,
    ) -> BoxStream<FlightData> {
        let stream = futures::stream::iter(batches.into_iter().map(Ok::<_, FlightError>));
        FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .build(stream)
            .map_err(Status::from)
            .boxed()
    }

    async fn get_flight_info_statement(
        &self,
        descriptor: FlightDescriptor,
        cmd: CommandStatementQuery,
    ) -> Result<FlightInfo, Status> {
        let info = self
            .backend
            .prepare(&cmd.query)
            .await
            .map_err(Status::from)?;
        let handle = ad_hoc_handle();
        self.ad_hoc.insert(handle, Arc::new(cmd.query));
        let ticket = envelope::pack_bytes(&TicketStatementQuery {
            statement_handle: handle.to_be_bytes().to_vec(),
        });
        Self::flight_info(descriptor, &info.dataset_schema, ticket)
    }

    async fn get_flight_info_prepared_statement(
        &self,
        descriptor: FlightDescriptor,
        cmd: CommandPreparedStatementQuery,
    ) -> Result<FlightInfo, Status> {
        let handle = decode_handle(&cmd.prepared_statement_handle)?;
        let (dataset_schema, _parameter_schema) =
            self.statements.schemas(handle).map_err(Status::from)?;
        let ticket = envelope::pack_bytes(&cmd);
        Self::flight_info(descriptor, &dataset_schema, ticket)
    }

    async fn do_get_statement(&self, ticket: TicketStatementQuery) -> Result<BoxStream<FlightData>, Status> {
        let handle = decode_handle(&ticket.statement_handle)?;
        let sql = self
            .ad_hoc
            .get(&handle)
            .ok_or_else(|| Status::from(FlightSqlError::HandleNotFound))?;
        let result = self.backend.execute_query(&sql, None).await.map_err(Status::from)?;
        Ok(Self::batches_stream(result.schema, result.batches))
    }

    async fn do_get_prepared_statement(
        &self,
        cmd: CommandPreparedStatementQuery,
    ) -> Result<BoxStream<FlightData>, Status> {
        let handle = decode_handle(&cmd.prepared_statement_handle)?;
        let backend = self.backend.clone();
        let result = self
            .statements
            .execute(handle, |sql, params| async move {
                backend.execute_query(&sql, params.as_ref()).await
            })
            .await
            .map_err(Status::from)?;
        Ok(Self::batches_stream(result.schema, result.batches))
    }
}

fn ad_hoc_handle() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn decode_handle(bytes: &[u8]) -> Result<u64, Status> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Status::from(FlightSqlError::InvalidRequest("malformed handle".to_string())))?;
    Ok(u64::from_be_bytes(array))
}

fn table_ref(catalog: Option<String>, schema: Option<String>, table: String) -> TableRef {
    TableRef::new(catalog, schema, table)
}

#[tonic::async_trait]
impl FlightService for FlightSqlDispatcher {
    type HandshakeStream = BoxStream<HandshakeResponse>;
    type ListFlightsStream = BoxStream<FlightInfo>;
    type DoGetStream = BoxStream<FlightData>;
    type DoPutStream = BoxStream<PutResult>;
    type DoActionStream = BoxStream<arrow_flight::Result>;
    type ListActionsStream = BoxStream<ActionType>;
    type DoExchangeStream = BoxStream<FlightData>;

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented(
            "authentication is a transport concern, out of scope for this engine",
        ))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("list_flights"))
    }

    #[instrument(skip(self, request))]
    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let descriptor = request.into_inner();
        let any = Self::decode_cmd(&descriptor)?;
        info!(type_url = %any.type_url, "get_flight_info");

        let info = if envelope::is::<CommandStatementQuery>(&any) {
            let cmd = envelope::unpack::<CommandStatementQuery>(&any).map_err(Status::from)?;
            self.get_flight_info_statement(descriptor, cmd).await?
        } else if envelope::is::<CommandPreparedStatementQuery>(&any) {
            let cmd =
                envelope::unpack::<CommandPreparedStatementQuery>(&any).map_err(Status::from)?;
            self.get_flight_info_prepared_statement(descriptor, cmd).await?
        } else if envelope::is::<CommandGetCatalogs>(&any) {
            let catalogs = self.backend.list_catalogs().await.map_err(Status::from)?;
            let _ = catalogs;
            let ticket = envelope::pack_bytes(&CommandGetCatalogs {});
            Self::flight_info(descriptor, &catalog::schema_get_catalogs(), ticket)?
        } else if envelope::is::<CommandGetSchemas>(&any) {
            let cmd = envelope::unpack::<CommandGetSchemas>(&any).map_err(Status::from)?;
            let ticket = envelope::pack_bytes(&cmd);
            Self::flight_info(descriptor, &catalog::schema_get_schemas(), ticket)?
        } else if envelope::is::<CommandGetTables>(&any) {
            let cmd = envelope::unpack::<CommandGetTables>(&any).map_err(Status::from)?;
            let schema = catalog::schema_get_tables(cmd.include_schema);
            let ticket = envelope::pack_bytes(&cmd);
            Self::flight_info(descriptor, &schema, ticket)?
        } else if envelope::is::<CommandGetTableTypes>(&any) {
            let ticket = envelope::pack_bytes(&CommandGetTableTypes {});
            Self::flight_info(descriptor, &catalog::schema_get_table_types(), ticket)?
        } else if envelope::is::<CommandGetSqlInfo>(&any) {
            let cmd = envelope::unpack::<CommandGetSqlInfo>(&any).map_err(Status::from)?;
            let ticket = envelope::pack_bytes(&cmd);
            Self::flight_info(descriptor, &catalog::schema_get_sql_info(), ticket)?
        } else if envelope::is::<CommandGetPrimaryKeys>(&any) {
            let cmd = envelope::unpack::<CommandGetPrimaryKeys>(&any).map_err(Status::from)?;
            let ticket = envelope::pack_bytes(&cmd);
            Self::flight_info(descriptor, &catalog::schema_get_primary_keys(), ticket)?
        } else if envelope::is::<CommandGetImportedKeys>(&any) {
            let cmd = envelope::unpack::<CommandGetImportedKeys>(&any).map_err(Status::from)?;
            let ticket = envelope::pack_bytes(&cmd);
            Self::flight_info(descriptor, &catalog::schema_key_reference(), ticket)?
        } else if envelope::is::<CommandGetExportedKeys>(&any) {
            let cmd = envelope::unpack::<CommandGetExportedKeys>(&any).map_err(Status::from)?;
            let ticket = envelope::pack_bytes(&cmd);
            Self::flight_info(descriptor, &catalog::schema_key_reference(), ticket)?
        } else if envelope::is::<CommandGetCrossReference>(&any) {
            let cmd = envelope::unpack::<CommandGetCrossReference>(&any).map_err(Status::from)?;
            let ticket = envelope::pack_bytes(&cmd);
            Self::flight_info(descriptor, &catalog::schema_key_reference(), ticket)?
        } else {
            return Err(Status::from(FlightSqlError::InvalidRequest(format!(
                "unrecognized command envelope: {}",
                any.type_url
            ))));
        };
        Ok(Response::new(info))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented(
            "long-running queries are out of scope; GetFlightInfo always returns the final result",
        ))
    }

    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let info = self.get_flight_info(request).await?.into_inner();
        Ok(Response::new(SchemaResult {
            schema: info.schema,
        }))
    }

    #[instrument(skip(self, request))]
    async fn do_get(&self, request: Request<Ticket>) -> Result<Response<Self::DoGetStream>, Status> {
        let ticket = request.into_inner();
        let any = Self::decode_ticket(&ticket)?;
        info!(type_url = %any.type_url, "do_get");

        let stream = if envelope::is::<TicketStatementQuery>(&any) {
            let cmd = envelope::unpack::<TicketStatementQuery>(&any).map_err(Status::from)?;
            self.do_get_statement(cmd).await?
        } else if envelope::is::<CommandPreparedStatementQuery>(&any) {
            let cmd =
                envelope::unpack::<CommandPreparedStatementQuery>(&any).map_err(Status::from)?;
            self.do_get_prepared_statement(cmd).await?
        } else if envelope::is::<CommandGetCatalogs>(&any) {
            let catalogs = self.backend.list_catalogs().await.map_err(Status::from)?;
            let schema = catalog::schema_get_catalogs();
            let batch = arrow_array::RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(arrow_array::StringArray::from(catalogs)) as arrow_array::ArrayRef],
            )
            .map_err(|e| status!("building catalogs batch", e))?;
            Self::batches_stream(schema, vec![batch])
        } else if envelope::is::<CommandGetSchemas>(&any) {
            let cmd = envelope::unpack::<CommandGetSchemas>(&any).map_err(Status::from)?;
            let rows = self
                .backend
                .list_schemas(cmd.catalog.as_deref(), cmd.schema_filter_pattern.as_deref())
                .await
                .map_err(Status::from)?;
            let schema = catalog::schema_get_schemas();
            let catalogs = arrow_array::StringArray::from_iter(rows.iter().map(|(c, _)| c.as_deref()));
            let schemas = arrow_array::StringArray::from_iter_values(rows.iter().map(|(_, s)| s.clone()));
            let batch = arrow_array::RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(catalogs) as arrow_array::ArrayRef,
                    Arc::new(schemas) as arrow_array::ArrayRef,
                ],
            )
            .map_err(|e| status!("building schemas batch", e))?;
            Self::batches_stream(schema, vec![batch])
        } else if envelope::is::<CommandGetTables>(&any) {
            let cmd = envelope::unpack::<CommandGetTables>(&any).map_err(Status::from)?;
            let tables = self
                .backend
                .list_tables(
                    cmd.catalog.as_deref(),
                    cmd.schema_filter_pattern.as_deref(),
                    cmd.table_name_filter_pattern.as_deref(),
                    &cmd.table_types,
                )
                .await
                .map_err(Status::from)?;
            let schema = catalog::schema_get_tables(cmd.include_schema);
            let catalogs =
                arrow_array::StringArray::from_iter(tables.iter().map(|t| t.table_ref.catalog.as_deref()));
            let schemas =
                arrow_array::StringArray::from_iter(tables.iter().map(|t| t.table_ref.schema.as_deref()));
            let names =
                arrow_array::StringArray::from_iter_values(tables.iter().map(|t| t.table_ref.table.clone()));
            let types =
                arrow_array::StringArray::from_iter_values(tables.iter().map(|t| t.table_type.clone()));
            let mut columns: Vec<arrow_array::ArrayRef> = vec![
                Arc::new(catalogs),
                Arc::new(schemas),
                Arc::new(names),
                Arc::new(types),
            ];
            if cmd.include_schema {
                let mut table_schema_bytes = Vec::with_capacity(tables.len());
                for t in &tables {
                    table_schema_bytes.push(Self::schema_ipc_bytes(&t.schema)?.to_vec());
                }
                columns.push(Arc::new(arrow_array::BinaryArray::from_iter_values(
                    table_schema_bytes,
                )));
            }
            let batch = arrow_array::RecordBatch::try_new(schema.clone(), columns)
                .map_err(|e| status!("building tables batch", e))?;
            Self::batches_stream(schema, vec![batch])
        } else if envelope::is::<CommandGetTableTypes>(&any) {
            let schema = catalog::schema_get_table_types();
            let batch = arrow_array::RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(arrow_array::StringArray::from(vec!["TABLE"])) as arrow_array::ArrayRef],
            )
            .map_err(|e| status!("building table_types batch", e))?;
            Self::batches_stream(schema, vec![batch])
        } else if envelope::is::<CommandGetSqlInfo>(&any) {
            let cmd = envelope::unpack::<CommandGetSqlInfo>(&any).map_err(Status::from)?;
            let rows = self.backend.sql_info(&cmd.info).await.map_err(Status::from)?;
            let batch = catalog::build_sql_info_batch(&rows);
            Self::batches_stream(catalog::schema_get_sql_info(), vec![batch])
        } else if envelope::is::<CommandGetPrimaryKeys>(&any) {
            if !self.backend.capabilities().primary_keys {
                return Err(Status::from(FlightSqlError::NotImplemented(
                    "GetPrimaryKeys".to_string(),
                )));
            }
            let cmd = envelope::unpack::<CommandGetPrimaryKeys>(&any).map_err(Status::from)?;
            let target = table_ref(cmd.catalog, cmd.schema, cmd.table);
            let rows = self.backend.primary_keys(&target).await.map_err(Status::from)?;
            let schema = catalog::schema_get_primary_keys();
            let catalogs = arrow_array::StringArray::from(vec![target.catalog.clone(); rows.len()]);
            let schemas = arrow_array::StringArray::from(vec![target.schema.clone(); rows.len()]);
            let names = arrow_array::StringArray::from(vec![target.table.clone(); rows.len()]);
            let columns_arr =
                arrow_array::StringArray::from_iter_values(rows.iter().map(|r| r.column_name.clone()));
            let key_names =
                arrow_array::StringArray::from_iter(rows.iter().map(|r| r.key_name.as_deref()));
            let sequences = arrow_array::Int32Array::from_iter_values(rows.iter().map(|r| r.key_sequence));
            let batch = arrow_array::RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(catalogs),
                    Arc::new(schemas),
                    Arc::new(names),
                    Arc::new(columns_arr),
                    Arc::new(key_names),
                    Arc::new(sequences),
                ],
            )
            .map_err(|e| status!("building primary_keys batch", e))?;
            Self::batches_stream(schema, vec![batch])
        } else if envelope::is::<CommandGetImportedKeys>(&any) {
            if !self.backend.capabilities().imported_keys {
                return Err(Status::from(FlightSqlError::NotImplemented(
                    "GetImportedKeys".to_string(),
                )));
            }
            let cmd = envelope::unpack::<CommandGetImportedKeys>(&any).map_err(Status::from)?;
            let target = table_ref(cmd.catalog, cmd.schema, cmd.table);
            let rows = self.backend.imported_keys(&target).await.map_err(Status::from)?;
            key_reference_stream(rows)?
        } else if envelope::is::<CommandGetExportedKeys>(&any) {
            if !self.backend.capabilities().exported_keys {
                return Err(Status::from(FlightSqlError::NotImplemented(
                    "GetExportedKeys".to_string(),
                )));
            }
            let cmd = envelope::unpack::<CommandGetExportedKeys>(&any).map_err(Status::from)?;
            let target = table_ref(cmd.catalog, cmd.schema, cmd.table);
            let rows = self.backend.exported_keys(&target).await.map_err(Status::from)?;
            key_reference_stream(rows)?
        } else if envelope::is::<CommandGetCrossReference>(&any) {
            if !self.backend.capabilities().cross_reference {
                return Err(Status::from(FlightSqlError::NotImplemented(
                    "GetCrossReference".to_string(),
                )));
            }
            let cmd = envelope::unpack::<CommandGetCrossReference>(&any).map_err(Status::from)?;
            let pk = table_ref(cmd.pk_catalog, cmd.pk_schema, cmd.pk_table);
            let fk = table_ref(cmd.fk_catalog, cmd.fk_schema, cmd.fk_table);
            let rows = self.backend.cross_reference(&pk, &fk).await.map_err(Status::from)?;
            key_reference_stream(rows)?
        } else {
            return Err(Status::from(FlightSqlError::InvalidRequest(format!(
                "unrecognized ticket envelope: {}",
                any.type_url
            ))));
        };
        Ok(Response::new(stream))
    }

    #[instrument(skip(self, request))]
    async fn do_put(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty DoPut stream"))?;
        let descriptor = first
            .flight_descriptor
            .clone()
            .ok_or_else(|| Status::invalid_argument("DoPut's first message must carry a descriptor"))?;
        let any = Self::decode_cmd(&descriptor)?;
        info!(type_url = %any.type_url, "do_put");

        let remaining: Vec<FlightData> = stream.try_collect().await?;
        let mut frames = Vec::with_capacity(1 + remaining.len());
        frames.push(first);
        frames.extend(remaining);
        let batches = arrow_flight::utils::flight_data_to_batches(&frames)
            .map_err(|e| status!("decoding parameter batches", e))?;

        let ack = if envelope::is::<CommandStatementUpdate>(&any) {
            if !self.backend.capabilities().updates {
                return Err(Status::from(FlightSqlError::NotImplemented(
                    "ExecuteUpdate".to_string(),
                )));
            }
            let cmd = envelope::unpack::<CommandStatementUpdate>(&any).map_err(Status::from)?;
            let count = self.backend.execute_update(&cmd.query, None).await.map_err(Status::from)?;
            pack_update_result(count)
        } else if envelope::is::<CommandPreparedStatementUpdate>(&any) {
            if !self.backend.capabilities().updates {
                return Err(Status::from(FlightSqlError::NotImplemented(
                    "PreparedStatementUpdate".to_string(),
                )));
            }
            let cmd =
                envelope::unpack::<CommandPreparedStatementUpdate>(&any).map_err(Status::from)?;
            let handle = decode_handle(&cmd.prepared_statement_handle)?;
            let param_batch = batches.into_iter().next();
            let backend = self.backend.clone();
            let count = self
                .statements
                .execute(handle, move |sql, _bound| {
                    let param_batch = param_batch.clone();
                    async move { backend.execute_update(&sql, param_batch.as_ref()).await }
                })
                .await
                .map_err(Status::from)?;
            pack_update_result(count)
        } else if envelope::is::<CommandPreparedStatementQuery>(&any) {
            let cmd =
                envelope::unpack::<CommandPreparedStatementQuery>(&any).map_err(Status::from)?;
            let handle = decode_handle(&cmd.prepared_statement_handle)?;
            let batch = batches
                .into_iter()
                .next()
                .ok_or_else(|| Status::invalid_argument("no parameter batch uploaded"))?;
            self.statements.bind_parameters(handle, batch).await.map_err(Status::from)?;
            PutResult {
                app_metadata: Default::default(),
            }
        } else {
            return Err(Status::from(FlightSqlError::InvalidRequest(format!(
                "unrecognized DoPut command envelope: {}",
                any.type_url
            ))));
        };

        let out = futures::stream::once(async move { Ok::<_, Status>(ack) });
        Ok(Response::new(out.boxed()))
    }

    #[instrument(skip(self, request))]
    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let action = request.into_inner();
        info!(action_type = %action.r#type, "do_action");
        let result = match action.r#type.as_str() {
            ACTION_CREATE_PREPARED_STATEMENT => {
                let any = envelope::unpack_tag(&action.body).map_err(Status::from)?;
                let cmd = envelope::unpack::<ActionCreatePreparedStatementRequest>(&any)
                    .map_err(Status::from)?;
                let handle = self.statements.create(cmd.query).await.map_err(Status::from)?;
                let result = ActionCreatePreparedStatementResult {
                    prepared_statement_handle: handle.handle.to_be_bytes().to_vec(),
                    dataset_schema: Self::schema_ipc_bytes(&handle.dataset_schema)?.to_vec(),
                    parameter_schema: Self::schema_ipc_bytes(&handle.parameter_schema)?.to_vec(),
                };
                arrow_flight::Result {
                    body: envelope::pack_bytes(&result).into(),
                }
            }
            ACTION_CLOSE_PREPARED_STATEMENT => {
                let any = envelope::unpack_tag(&action.body).map_err(Status::from)?;
                let cmd = envelope::unpack::<ActionClosePreparedStatementRequest>(&any)
                    .map_err(Status::from)?;
                let handle = decode_handle(&cmd.prepared_statement_handle)?;
                self.statements.close(handle).await;
                arrow_flight::Result {
                    body: Default::default(),
                }
            }
            other => {
                return Err(Status::from(FlightSqlError::NotImplemented(format!(
                    "unknown action: {other}"
                ))))
            }
        };
        let out = futures::stream::once(async move { Ok::<_, Status>(result) });
        Ok(Response::new(out.boxed()))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = vec![
            Ok(ActionType {
                r#type: ACTION_CREATE_PREPARED_STATEMENT.to_string(),
                description: "Create a prepared statement for a SQL query".to_string(),
            }),
            Ok(ActionType {
                r#type: ACTION_CLOSE_PREPARED_STATEMENT.to_string(),
                description: "Close a prepared statement, releasing its handle".to_string(),
            }),
        ];
        Ok(Response::new(futures::stream::iter(actions).boxed()))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented(
            "bidirectional exchange is outside the command set this engine defines",
        ))
    }
}

fn pack_update_result(count: i64) -> PutResult {
    PutResult {
        app_metadata: envelope::pack_bytes(&DoPutUpdateResult { record_count: count }).into(),
    }
}

fn key_reference_stream(
    rows: Vec<crate::backend::KeyReferenceRow>,
) -> Result<BoxStream<FlightData>, Status> {
    let schema = catalog::schema_key_reference();
    let pk_catalogs = arrow_array::StringArray::from_iter(rows.iter().map(|r| r.pk_table.catalog.as_deref()));
    let pk_schemas = arrow_array::StringArray::from_iter(rows.iter().map(|r| r.pk_table.schema.as_deref()));
    let pk_tables = arrow_array::StringArray::from_iter_values(rows.iter().map(|r| r.pk_table.table.clone()));
    let pk_columns = arrow_array::StringArray::from_iter_values(rows.iter().map(|r| r.pk_column.clone()));
    let fk_catalogs = arrow_array::StringArray::from_iter(rows.iter().map(|r| r.fk_table.catalog.as_deref()));
    let fk_schemas = arrow_array::StringArray::from_iter(rows.iter().map(|r| r.fk_table.schema.as_deref()));
    let fk_tables = arrow_array::StringArray::from_iter_values(rows.iter().map(|r| r.fk_table.table.clone()));
    let fk_columns = arrow_array::StringArray::from_iter_values(rows.iter().map(|r| r.fk_column.clone()));
    let sequences = arrow_array::Int32Array::from_iter_values(rows.iter().map(|r| r.key_sequence));
    let fk_key_names = arrow_array::StringArray::from_iter(rows.iter().map(|r| r.fk_key_name.as_deref()));
    let pk_key_names = arrow_array::StringArray::from_iter(rows.iter().map(|r| r.pk_key_name.as_deref()));
    let update_rules = arrow_array::UInt8Array::from_iter_values(rows.iter().map(|r| r.update_rule));
    let delete_rules = arrow_array::UInt8Array::from_iter_values(rows.iter().map(|r| r.delete_rule));
    let batch = arrow_array::RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(pk_catalogs),
            Arc::new(pk_schemas),
            Arc::new(pk_tables),
            Arc::new(pk_columns),
            Arc::new(fk_catalogs),
            Arc::new(fk_schemas),
            Arc::new(fk_tables),
            Arc::new(fk_columns),
            Arc::new(sequences),
            Arc::new(fk_key_names),
            Arc::new(pk_key_names),
            Arc::new(update_rules),
            Arc::new(delete_rules),
        ],
    )
    .map_err(|e| status!("building key reference batch", e))?;
    Ok(FlightSqlDispatcher::batches_stream(schema, vec![batch]))
}
