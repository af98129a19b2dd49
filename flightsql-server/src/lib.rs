//! The Flight SQL server dispatcher and prepared-statement lifecycle
//! manager, plus a reference `SqlBackend` implementation.
//!
//! The dispatcher implements `arrow_flight::flight_service_server::
//! FlightService` directly rather than the crate's `FlightSqlService`
//! convenience trait, so a caller only needs `tonic::transport::Server`
//! and this crate's `FlightSqlDispatcher` to stand up a server.

pub mod backend;
pub mod dispatcher;
pub mod prepared;

pub use backend::{BackendCapabilities, SqlBackend};
pub use dispatcher::FlightSqlDispatcher;
pub use prepared::PreparedStatementCache;
