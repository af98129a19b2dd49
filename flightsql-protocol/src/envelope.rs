//! The command envelope codec (`spec.md` §4.1 / §6).
//!
//! Every Flight SQL command travels inside a `FlightDescriptor.cmd`,
//! `Ticket.ticket`, or `Action.body` as an encoded [`prost_types::Any`]
//! whose `type_url` names one of the variants below. The message bodies
//! are hand-written `prost::Message` structs rather than generated from
//! a `.proto` file, so this crate has no build-script/protoc dependency;
//! field names and presence semantics match the published Flight SQL
//! schema registry described in `spec.md` §6.

use prost::Message;
use prost_types::Any;

use crate::error::EnvelopeError;

/// A command body that can be packed into / unpacked from a Flight
/// descriptor, ticket, or action.
pub trait SqlCommand: Message + Default + Clone {
    /// Fully-qualified type URL, e.g.
    /// `type.googleapis.com/arrow.flight.protocol.sql.CommandStatementQuery`.
    const TYPE_URL: &'static str;
}

/// Encode `command` as a tagged [`Any`] envelope. Two calls on equal
/// values produce equal bytes (prost's encoding is deterministic for the
/// field types used here).
pub fn pack<T: SqlCommand>(command: &T) -> Any {
    Any {
        type_url: T::TYPE_URL.to_string(),
        value: command.encode_to_vec(),
    }
}

/// Encode `command` straight to the bytes that belong in a
/// `FlightDescriptor.cmd`, `Ticket.ticket`, or `Action.body` field.
pub fn pack_bytes<T: SqlCommand>(command: &T) -> Vec<u8> {
    pack(command).encode_to_vec()
}

/// Decode a tagged envelope previously produced by [`pack_bytes`].
pub fn unpack_bytes<T: SqlCommand>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    let any = Any::decode(bytes).map_err(EnvelopeError::Decode)?;
    unpack(&any)
}

/// Decode `any` as `T`, failing with [`EnvelopeError::TypeMismatch`] if
/// the tag does not name `T`.
pub fn unpack<T: SqlCommand>(any: &Any) -> Result<T, EnvelopeError> {
    if any.type_url != T::TYPE_URL {
        return Err(EnvelopeError::TypeMismatch {
            expected: T::TYPE_URL,
            found: any.type_url.clone(),
        });
    }
    T::decode(any.value.as_slice()).map_err(EnvelopeError::Decode)
}

/// Tag-only check, without decoding the payload.
pub fn is<T: SqlCommand>(any: &Any) -> bool {
    any.type_url == T::TYPE_URL
}

/// Decode the outer `Any` wrapper from raw bytes, returning the tag and
/// the still-encoded payload. Used by the dispatcher to route before it
/// knows which concrete command type to decode into.
pub fn unpack_tag(bytes: &[u8]) -> Result<Any, EnvelopeError> {
    Any::decode(bytes).map_err(EnvelopeError::Decode)
}

macro_rules! sql_command {
    ($name:ident { $($field_vis:vis $field:ident : $ty:ty => $prost:meta),* $(,)? }) => {
        #[derive(Clone, PartialEq, Eq, ::prost::Message)]
        pub struct $name {
            $(
                #[$prost]
                $field_vis $field: $ty,
            )*
        }

        impl SqlCommand for $name {
            const TYPE_URL: &'static str = concat!(
                "type.googleapis.com/arrow.flight.protocol.sql.",
                stringify!($name)
            );
        }
    };
}

sql_command!(CommandStatementQuery {
    pub query: String => prost(string, tag = "1"),
    pub client_execution_handle: Option<Vec<u8>> => prost(bytes = "vec", optional, tag = "2"),
});

sql_command!(CommandStatementUpdate {
    pub query: String => prost(string, tag = "1"),
});

sql_command!(CommandPreparedStatementQuery {
    pub prepared_statement_handle: Vec<u8> => prost(bytes = "vec", tag = "1"),
});

sql_command!(CommandPreparedStatementUpdate {
    pub prepared_statement_handle: Vec<u8> => prost(bytes = "vec", tag = "1"),
});

sql_command!(TicketStatementQuery {
    pub statement_handle: Vec<u8> => prost(bytes = "vec", tag = "1"),
});

sql_command!(CommandGetCatalogs {});

sql_command!(CommandGetSchemas {
    pub catalog: Option<String> => prost(string, optional, tag = "1"),
    pub schema_filter_pattern: Option<String> => prost(string, optional, tag = "2"),
});

sql_command!(CommandGetTables {
    pub catalog: Option<String> => prost(string, optional, tag = "1"),
    pub schema_filter_pattern: Option<String> => prost(string, optional, tag = "2"),
    pub table_name_filter_pattern: Option<String> => prost(string, optional, tag = "3"),
    pub table_types: Vec<String> => prost(string, repeated, tag = "4"),
    pub include_schema: bool => prost(bool, tag = "5"),
});

sql_command!(CommandGetTableTypes {});

sql_command!(CommandGetSqlInfo {
    pub info: Vec<u32> => prost(uint32, repeated, tag = "1"),
});

sql_command!(CommandGetPrimaryKeys {
    pub catalog: Option<String> => prost(string, optional, tag = "1"),
    pub schema: Option<String> => prost(string, optional, tag = "2"),
    pub table: String => prost(string, tag = "3"),
});

sql_command!(CommandGetImportedKeys {
    pub catalog: Option<String> => prost(string, optional, tag = "1"),
    pub schema: Option<String> => prost(string, optional, tag = "2"),
    pub table: String => prost(string, tag = "3"),
});

sql_command!(CommandGetExportedKeys {
    pub catalog: Option<String> => prost(string, optional, tag = "1"),
    pub schema: Option<String> => prost(string, optional, tag = "2"),
    pub table: String => prost(string, tag = "3"),
});

sql_command!(CommandGetCrossReference {
    pub pk_catalog: Option<String> => prost(string, optional, tag = "1"),
    pub pk_schema: Option<String> => prost(string, optional, tag = "2"),
    pub pk_table: String => prost(string, tag = "3"),
    pub fk_catalog: Option<String> => prost(string, optional, tag = "4"),
    pub fk_schema: Option<String> => prost(string, optional, tag = "5"),
    pub fk_table: String => prost(string, tag = "6"),
});

sql_command!(ActionCreatePreparedStatementRequest {
    pub query: String => prost(string, tag = "1"),
});

sql_command!(ActionCreatePreparedStatementResult {
    pub prepared_statement_handle: Vec<u8> => prost(bytes = "vec", tag = "1"),
    pub dataset_schema: Vec<u8> => prost(bytes = "vec", tag = "2"),
    pub parameter_schema: Vec<u8> => prost(bytes = "vec", tag = "3"),
});

sql_command!(ActionClosePreparedStatementRequest {
    pub prepared_statement_handle: Vec<u8> => prost(bytes = "vec", tag = "1"),
});

sql_command!(DoPutUpdateResult {
    pub record_count: i64 => prost(int64, tag = "1"),
});

/// The two actions the dispatcher's `ListActions` verb must advertise,
/// `spec.md` §6.
pub const ACTION_CREATE_PREPARED_STATEMENT: &str = "CreatePreparedStatement";
pub const ACTION_CLOSE_PREPARED_STATEMENT: &str = "ClosePreparedStatement";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_statement_query() {
        let cmd = CommandStatementQuery {
            query: "select 1".to_string(),
            client_execution_handle: Some(vec![1, 2, 3]),
        };
        let bytes = pack_bytes(&cmd);
        let any = unpack_tag(&bytes).unwrap();
        assert!(is::<CommandStatementQuery>(&any));
        assert_eq!(unpack::<CommandStatementQuery>(&any).unwrap(), cmd);
    }

    #[test]
    fn pack_is_deterministic() {
        let cmd = CommandGetTables {
            catalog: None,
            schema_filter_pattern: Some(String::new()),
            table_name_filter_pattern: None,
            table_types: vec!["TABLE".to_string()],
            include_schema: false,
        };
        assert_eq!(pack_bytes(&cmd), pack_bytes(&cmd));
    }

    #[test]
    fn three_valued_filter_semantics_round_trip() {
        // absent
        let absent = CommandGetSchemas {
            catalog: None,
            schema_filter_pattern: None,
        };
        // empty string ("without a catalog")
        let empty = CommandGetSchemas {
            catalog: Some(String::new()),
            schema_filter_pattern: None,
        };
        let decoded_absent: CommandGetSchemas = unpack_bytes(&pack_bytes(&absent)).unwrap();
        let decoded_empty: CommandGetSchemas = unpack_bytes(&pack_bytes(&empty)).unwrap();
        assert_eq!(decoded_absent.catalog, None);
        assert_eq!(decoded_empty.catalog, Some(String::new()));
    }

    #[test]
    fn unpack_rejects_wrong_tag() {
        let cmd = CommandGetCatalogs {};
        let any = pack(&cmd);
        let err = unpack::<CommandGetTableTypes>(&any).unwrap_err();
        assert!(matches!(err, EnvelopeError::TypeMismatch { .. }));
    }

    #[test]
    fn is_does_not_decode_payload() {
        // Garbage payload bytes but a correct tag: `is` must not fail.
        let any = Any {
            type_url: CommandGetCatalogs::TYPE_URL.to_string(),
            value: vec![0xff, 0xff, 0xff],
        };
        assert!(is::<CommandGetCatalogs>(&any));
    }
}
