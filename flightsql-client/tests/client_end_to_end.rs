//! Exercises `Client`/`PreparedStatement` against an in-process
//! `flightsql-server`, the same duplex-stream wiring
//! `flightsql-server`'s own integration tests use.

use std::sync::Arc;
use std::time::Duration;

use arrow_flight::flight_service_server::FlightServiceServer;
use flightsql_client::Client;
use flightsql_server::backend::datafusion::DataFusionBackend;
use flightsql_server::dispatcher::FlightSqlDispatcher;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tower::service_fn;

async fn test_client() -> Client {
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
    let channel: Channel = Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| {
            let client_io = client_io.take().expect("duplex connector used once");
            async move { Ok::<_, std::io::Error>(client_io) }
        }))
        .await
        .unwrap();
    Client::new(channel)
}

#[tokio::test]
async fn ad_hoc_query_round_trips_fixture_rows() {
    let mut client = test_client().await;
    let info = client.execute("SELECT * FROM intTable").await.unwrap();
    let batches = client.read_all(&info).await.unwrap();
    let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total_rows, 3);
}

#[tokio::test]
async fn insert_then_delete_matches_spec_scenario_counts() {
    let mut client = test_client().await;
    let inserted = client
        .execute_update("INSERT INTO INTTABLE (keyName, value) VALUES ('A',1),('B',2),('C',3)")
        .await
        .unwrap();
    assert_eq!(inserted, 3);

    let deleted = client
        .execute_update("DELETE FROM INTTABLE WHERE keyName IN ('A','C')")
        .await
        .unwrap();
    assert_eq!(deleted, 2);
}

#[tokio::test]
async fn prepared_statement_query_round_trips_and_closes_idempotently() {
    let mut client = test_client().await;
    let mut stmt = client.prepare("SELECT * FROM intTable").await.unwrap();
    assert_eq!(stmt.dataset_schema().fields().len(), 4);

    let batches = stmt.execute_to_batches(None).await.unwrap();
    let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total_rows, 3);

    stmt.close().await.unwrap();
}

#[tokio::test]
async fn get_tables_lists_both_fixture_tables() {
    let mut client = test_client().await;
    let info = client
        .get_tables(None, None, None, vec!["TABLE".to_string()], false)
        .await
        .unwrap();
    let batches = client.read_all(&info).await.unwrap();
    let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total_rows, 2);
}

#[tokio::test]
async fn get_primary_keys_of_inttable_returns_one_row() {
    let mut client = test_client().await;
    let info = client
        .get_primary_keys(None, None, "INTTABLE".to_string())
        .await
        .unwrap();
    let batches = client.read_all(&info).await.unwrap();
    let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total_rows, 1);
}
