//! A typed Flight SQL client built directly on
//! `arrow_flight::flight_service_client::FlightServiceClient`, the raw
//! four-verb stub, the same way `flightsql-server` builds its
//! dispatcher on the raw `FlightService` trait rather than the crate's
//! `sql::client::FlightSqlServiceClient` convenience wrapper.

pub mod client;
pub mod pool;
pub mod prepared_statement;

pub use client::Client;
pub use pool::LocationPool;
pub use prepared_statement::PreparedStatement;
