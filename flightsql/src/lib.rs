//! Umbrella crate: the typed client is always available; the
//! dispatcher and reference backend are additionally exposed behind
//! the `server` feature, the way `micromegas`'s own umbrella crate
//! gates its server-side re-exports.

pub mod protocol {
    pub use flightsql_protocol::*;
}

pub mod client {
    pub use flightsql_client::*;
}

#[cfg(feature = "server")]
pub mod server {
    pub use flightsql_server::*;
}
