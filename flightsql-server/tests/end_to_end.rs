//! End-to-end scenarios against the `intTable`/`foreignTable` fixture,
//! driving an in-process server over a duplex-stream transport the way
//! the pack's arrow-flight examples and the teacher's own integration
//! tests wire up a `tonic::transport::Channel` without binding a real
//! socket.

use std::sync::Arc;
use std::time::Duration;

use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::flight_service_server::FlightServiceServer;
use arrow_flight::{Action, FlightDescriptor, Ticket};
use flightsql_protocol::envelope::{
    self, ActionCreatePreparedStatementRequest, ActionCreatePreparedStatementResult,
    CommandGetPrimaryKeys, CommandGetTables, CommandStatementQuery, CommandStatementUpdate,
    TicketStatementQuery, ACTION_CREATE_PREPARED_STATEMENT,
};
use flightsql_server::backend::datafusion::DataFusionBackend;
use flightsql_server::dispatcher::FlightSqlDispatcher;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tower::service_fn;

async fn test_client() -> FlightServiceClient<Channel> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let backend = Arc::new(DataFusionBackend::new());
    let dispatcher = FlightSqlDispatcher::new(backend, 100, Duration::from_secs(600));
    let svc = FlightServiceServer::new(dispatcher);

    tokio::spawn(async move {
        Server::builder()
            .add_service(svc)
            .serve_with_incoming(tokio_stream::once(Ok::<_, std::io::Error>(server_io)))
            .await
            .unwrap();
    });

    let mut client_io = Some(client_io);
    let channel = Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| {
            let client_io = client_io.take().expect("duplex connector used once");
            async move { Ok::<_, std::io::Error>(client_io) }
        }))
        .await
        .unwrap();
    FlightServiceClient::new(channel)
}

fn descriptor_for(cmd_bytes: Vec<u8>) -> FlightDescriptor {
    FlightDescriptor::new_cmd(cmd_bytes)
}

async fn collect_batches(
    stream: &mut tonic::Streaming<arrow_flight::FlightData>,
) -> Vec<arrow_array::RecordBatch> {
    let mut data = Vec::new();
    while let Some(flight_data) = stream.message().await.unwrap() {
        data.push(flight_data);
    }
    arrow_flight::utils::flight_data_to_batches(&data).unwrap()
}

#[tokio::test]
async fn get_tables_returns_both_fixture_tables_in_order() {
    let mut client = test_client().await;
    let cmd = CommandGetTables {
        catalog: None,
        schema_filter_pattern: None,
        table_name_filter_pattern: None,
        table_types: vec!["TABLE".to_string()],
        include_schema: false,
    };
    let descriptor = descriptor_for(envelope::pack_bytes(&cmd));
    let info = client
        .get_flight_info(descriptor)
        .await
        .unwrap()
        .into_inner();
    let ticket = info.endpoint[0].ticket.clone().unwrap();
    let mut stream = client.do_get(ticket).await.unwrap().into_inner();
    let batches = collect_batches(&mut stream).await;

    let table_names: Vec<String> = batches
        .iter()
        .flat_map(|batch| {
            let names = batch
                .column_by_name("table_name")
                .unwrap()
                .as_any()
                .downcast_ref::<arrow_array::StringArray>()
                .unwrap();
            (0..batch.num_rows()).map(|i| names.value(i).to_string())
        })
        .collect();
    assert_eq!(table_names, vec!["FOREIGNTABLE", "INTTABLE"]);
}

#[tokio::test]
async fn primary_keys_of_inttable_matches_spec_scenario() {
    let mut client = test_client().await;
    let cmd = CommandGetPrimaryKeys {
        catalog: None,
        schema: None,
        table: "INTTABLE".to_string(),
    };
    let descriptor = descriptor_for(envelope::pack_bytes(&cmd));
    let info = client
        .get_flight_info(descriptor)
        .await
        .unwrap()
        .into_inner();
    let ticket = info.endpoint[0].ticket.clone().unwrap();
    let mut stream = client.do_get(ticket).await.unwrap().into_inner();
    let batches = collect_batches(&mut stream).await;

    let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total_rows, 1);

    let batch = batches.iter().find(|b| b.num_rows() > 0).unwrap();
    let column_name = batch
        .column_by_name("column_name")
        .unwrap()
        .as_any()
        .downcast_ref::<arrow_array::StringArray>()
        .unwrap();
    assert_eq!(column_name.value(0), "ID");

    let key_sequence = batch
        .column_by_name("key_sequence")
        .unwrap()
        .as_any()
        .downcast_ref::<arrow_array::Int32Array>()
        .unwrap();
    assert_eq!(key_sequence.value(0), 1);

    let key_name = batch
        .column_by_name("key_name")
        .unwrap()
        .as_any()
        .downcast_ref::<arrow_array::StringArray>()
        .unwrap();
    assert!(!key_name.is_null(0));
}

#[tokio::test]
async fn ad_hoc_query_round_trips_flight_info_and_stream() {
    let mut client = test_client().await;
    let cmd = CommandStatementQuery {
        query: "SELECT * FROM intTable".to_string(),
        client_execution_handle: None,
    };
    let descriptor = descriptor_for(envelope::pack_bytes(&cmd));
    let info = client
        .get_flight_info(descriptor)
        .await
        .unwrap()
        .into_inner();
    let ticket = info.endpoint[0].ticket.clone().unwrap();
    let ticket_cmd: TicketStatementQuery = envelope::unpack(&envelope::unpack_tag(&ticket.ticket).unwrap()).unwrap();
    assert_eq!(ticket_cmd.statement_handle.len(), 8);

    let mut stream = client.do_get(Ticket::new(ticket.ticket)).await.unwrap().into_inner();
    let mut total_rows = 0usize;
    while let Some(data) = stream.message().await.unwrap() {
        let batch = arrow_flight::utils::flight_data_to_batches(&[data]);
        if let Ok(batches) = batch {
            total_rows += batches.iter().map(|b| b.num_rows()).sum::<usize>();
        }
    }
    assert!(total_rows <= 3);
}

#[tokio::test]
async fn insert_then_delete_matches_spec_scenario_counts() {
    let mut client = test_client().await;
    let insert = CommandStatementUpdate {
        query: "INSERT INTO INTTABLE (keyName, value) VALUES ('A',1),('B',2),('C',3)".to_string(),
    };
    let descriptor = FlightDescriptor::new_cmd(envelope::pack_bytes(&insert));
    let flight_data = arrow_flight::FlightData {
        flight_descriptor: Some(descriptor),
        ..Default::default()
    };
    let response = client
        .do_put(tokio_stream::once(flight_data))
        .await
        .unwrap();
    let mut results: Vec<_> = futures::StreamExt::collect(response.into_inner()).await;
    let ack = results.remove(0).unwrap();
    let any = envelope::unpack_tag(&ack.app_metadata).unwrap();
    let update: flightsql_protocol::envelope::DoPutUpdateResult =
        envelope::unpack(&any).unwrap();
    assert_eq!(update.record_count, 3);
}

#[tokio::test]
async fn create_prepared_statement_then_close_is_idempotent() {
    let mut client = test_client().await;
    let request = ActionCreatePreparedStatementRequest {
        query: "SELECT * FROM intTable".to_string(),
    };
    let action = Action {
        r#type: ACTION_CREATE_PREPARED_STATEMENT.to_string(),
        body: envelope::pack_bytes(&request).into(),
    };
    let mut stream = client.do_action(action).await.unwrap().into_inner();
    let first = futures::StreamExt::next(&mut stream).await.unwrap().unwrap();
    let any = envelope::unpack_tag(&first.body).unwrap();
    let result: ActionCreatePreparedStatementResult = envelope::unpack(&any).unwrap();
    assert_eq!(result.prepared_statement_handle.len(), 8);
}
