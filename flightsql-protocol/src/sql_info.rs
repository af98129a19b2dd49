//! `SqlInfo` identifiers accepted by `CommandGetSqlInfo` (`spec.md` §6).
//!
//! These mirror the numbering of the published Flight SQL `SqlInfo` enum
//! closely enough for a client written against the real protocol to
//! recognize them; the engine only needs to round-trip the ones a
//! backend actually answers for. Boolean-valued codes are reported
//! through the `int32` union arm as `0`/`1` (`catalog::SqlInfoValue` has
//! no boolean arm).

/// Server name, reported as a UTF8 value.
pub const FLIGHT_SQL_SERVER_NAME: u32 = 0;
/// Server version string, reported as a UTF8 value.
pub const FLIGHT_SQL_SERVER_VERSION: u32 = 1;
/// Arrow format version the server speaks, reported as a UTF8 value.
pub const FLIGHT_SQL_SERVER_ARROW_VERSION: u32 = 2;
/// Whether the server is read-only, reported as an int32 `0`/`1`.
pub const FLIGHT_SQL_SERVER_READ_ONLY: u32 = 3;

/// Whether `CREATE`/`DROP CATALOG` is supported, reported as an int32
/// `0`/`1`.
pub const SQL_DDL_CATALOG: u32 = 500;
/// Whether `CREATE`/`DROP SCHEMA` is supported, reported as an int32
/// `0`/`1`.
pub const SQL_DDL_SCHEMA: u32 = 501;
/// Whether `CREATE`/`DROP TABLE` is supported, reported as an int32
/// `0`/`1`.
pub const SQL_DDL_TABLE: u32 = 502;
/// How the server treats unquoted identifier case, reported as an
/// int32 enumerating the published `SqlSupportedCaseSensitivity` arm
/// (`0` = unknown, `1` = case-sensitive, `2` = uppercase, `3` =
/// lowercase, `4` = case-insensitive mixed case).
pub const SQL_IDENTIFIER_CASE: u32 = 503;
/// The character used to quote an identifier, reported as a UTF8
/// value (empty string if quoting is not supported).
pub const SQL_IDENTIFIER_QUOTE_CHAR: u32 = 504;
/// How the server treats quoted identifier case, same value space as
/// [`SQL_IDENTIFIER_CASE`].
pub const SQL_QUOTED_IDENTIFIER_CASE: u32 = 505;

/// Whether the backend supports SQL transactions, reported as an int32
/// enumerating the supported isolation model (0 = none).
pub const SQL_TRANSACTIONS_SUPPORTED: u32 = 560;
/// Whether batch updates are supported, reported as an int32 `0`/`1`.
pub const SQL_BATCH_UPDATES_SUPPORTED: u32 = 561;
