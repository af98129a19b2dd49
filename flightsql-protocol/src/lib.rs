//! Command envelope codec and fixed result-schema catalog for the
//! Flight SQL protocol engine.
//!
//! This crate has no notion of a gRPC service or a SQL backend; it only
//! knows how to pack and unpack the command envelopes that travel over
//! the four generic Flight verbs, and what shape the catalog-metadata
//! results must take. `flightsql-server` and `flightsql-client` both
//! depend on it so the wire contract lives in exactly one place.

pub mod catalog;
pub mod envelope;
pub mod error;
pub mod sql_info;

pub use catalog::TableRef;
pub use error::{EnvelopeError, FlightSqlError};
