//! Fixed result schemas for the catalog-metadata commands (`spec.md` §5,
//! §6). Each `GetX` command has exactly one valid result schema; these
//! builders are the single source of truth a backend, the dispatcher,
//! and a client all agree on.

use std::sync::Arc;

use arrow_array::builder::{UInt32Builder, UnionBuilder};
use arrow_array::{ArrayRef, RecordBatch, UInt32Array};
use arrow_schema::{DataType, Field, Schema, SchemaRef, UnionFields, UnionMode};

/// `CommandGetCatalogs` result schema: `catalog_name: utf8 not null`.
pub fn schema_get_catalogs() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new(
        "catalog_name",
        DataType::Utf8,
        false,
    )]))
}

/// `CommandGetSchemas` result schema.
pub fn schema_get_schemas() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("catalog_name", DataType::Utf8, true),
        Field::new("db_schema_name", DataType::Utf8, false),
    ]))
}

/// `CommandGetTables` result schema. `include_schema` controls whether
/// the trailing `table_schema` (serialized IPC schema bytes) column is
/// present, per the command's `include_schema` flag.
pub fn schema_get_tables(include_schema: bool) -> SchemaRef {
    let mut fields = vec![
        Field::new("catalog_name", DataType::Utf8, true),
        Field::new("db_schema_name", DataType::Utf8, true),
        Field::new("table_name", DataType::Utf8, false),
        Field::new("table_type", DataType::Utf8, false),
    ];
    if include_schema {
        fields.push(Field::new("table_schema", DataType::Binary, false));
    }
    Arc::new(Schema::new(fields))
}

/// `CommandGetTableTypes` result schema.
pub fn schema_get_table_types() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new(
        "table_type",
        DataType::Utf8,
        false,
    )]))
}

/// The value kinds a backend can report for a `SqlInfo` entry. The
/// dense union in [`schema_get_sql_info`] carries exactly these four
/// arms, in this ordinal order: `string`, `int32`, `int64`,
/// `int32-bitmask`. A backend returning a richer set (string lists,
/// string-to-int32-list maps) is out of scope, `spec.md` §5 Non-goals.
/// Boolean-valued info (e.g. read-only) is carried through the `int32`
/// arm as `0`/`1`: there is no boolean arm in this layout.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlInfoValue {
    Utf8(String),
    Int32(i32),
    Int64(i64),
    Bitmask(i32),
}

const SQL_INFO_UNION_UTF8: i8 = 0;
const SQL_INFO_UNION_INT32: i8 = 1;
const SQL_INFO_UNION_INT64: i8 = 2;
const SQL_INFO_UNION_BITMASK: i8 = 3;

fn sql_info_union_fields() -> UnionFields {
    UnionFields::new(
        vec![
            SQL_INFO_UNION_UTF8,
            SQL_INFO_UNION_INT32,
            SQL_INFO_UNION_INT64,
            SQL_INFO_UNION_BITMASK,
        ],
        vec![
            Field::new("string_value", DataType::Utf8, false),
            Field::new("int32_value", DataType::Int32, false),
            Field::new("int64_value", DataType::Int64, false),
            Field::new("int32_bitmask_value", DataType::Int32, false),
        ],
    )
}

/// `CommandGetSqlInfo` result schema: `info_name: uint32 not null`,
/// `value: dense union not null` over the arms above.
pub fn schema_get_sql_info() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("info_name", DataType::UInt32, false),
        Field::new(
            "value",
            DataType::Union(sql_info_union_fields(), UnionMode::Dense),
            false,
        ),
    ]))
}

/// Build a `CommandGetSqlInfo` result batch from the rows a backend
/// reports for the requested info codes, preserving request order.
pub fn build_sql_info_batch(rows: &[(u32, SqlInfoValue)]) -> RecordBatch {
    let mut info_names = UInt32Builder::with_capacity(rows.len());
    let mut union_builder = UnionBuilder::new_dense();
    for (code, value) in rows {
        info_names.append_value(*code);
        match value {
            SqlInfoValue::Utf8(s) => union_builder.append::<arrow_array::types::Utf8Type>("string_value", s.clone()).unwrap(),
            SqlInfoValue::Int32(i) => union_builder.append::<arrow_array::types::Int32Type>("int32_value", *i).unwrap(),
            SqlInfoValue::Int64(i) => union_builder.append::<arrow_array::types::Int64Type>("int64_value", *i).unwrap(),
            SqlInfoValue::Bitmask(b) => union_builder.append::<arrow_array::types::Int32Type>("int32_bitmask_value", *b).unwrap(),
        }
    }
    let info_names: UInt32Array = info_names.finish();
    let value_array = union_builder.build().expect("dense union fields are well-formed");
    RecordBatch::try_new(
        schema_get_sql_info(),
        vec![Arc::new(info_names) as ArrayRef, Arc::new(value_array) as ArrayRef],
    )
    .expect("info_name and value columns have matching length")
}

/// `CommandGetPrimaryKeys` result schema.
pub fn schema_get_primary_keys() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("catalog_name", DataType::Utf8, true),
        Field::new("db_schema_name", DataType::Utf8, true),
        Field::new("table_name", DataType::Utf8, false),
        Field::new("column_name", DataType::Utf8, false),
        Field::new("key_name", DataType::Utf8, true),
        Field::new("key_sequence", DataType::Int32, false),
    ]))
}

/// Shared result schema for `CommandGetImportedKeys`, `CommandGetExportedKeys`,
/// and `CommandGetCrossReference`: they differ only in which table the
/// request pins, not in the shape of the foreign-key rows they return.
pub fn schema_key_reference() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("pk_catalog_name", DataType::Utf8, true),
        Field::new("pk_db_schema_name", DataType::Utf8, true),
        Field::new("pk_table_name", DataType::Utf8, false),
        Field::new("pk_column_name", DataType::Utf8, false),
        Field::new("fk_catalog_name", DataType::Utf8, true),
        Field::new("fk_db_schema_name", DataType::Utf8, true),
        Field::new("fk_table_name", DataType::Utf8, false),
        Field::new("fk_column_name", DataType::Utf8, false),
        Field::new("key_sequence", DataType::Int32, false),
        Field::new("fk_key_name", DataType::Utf8, true),
        Field::new("pk_key_name", DataType::Utf8, true),
        Field::new("update_rule", DataType::UInt8, false),
        Field::new("delete_rule", DataType::UInt8, false),
    ]))
}

/// A backend-agnostic reference to a table, used by the catalog
/// metadata commands and by the backend capability trait.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn new(catalog: Option<String>, schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            catalog,
            schema,
            table: table.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_info_batch_round_trips_four_value_kinds() {
        let rows = vec![
            (0u32, SqlInfoValue::Utf8("flightsql-engine".to_string())),
            (3u32, SqlInfoValue::Int32(1)),
            (8u32, SqlInfoValue::Int64(0)),
            (560u32, SqlInfoValue::Bitmask(0b0101)),
        ];
        let batch = build_sql_info_batch(&rows);
        assert_eq!(batch.num_rows(), 4);
        assert_eq!(batch.schema(), schema_get_sql_info());
    }

    #[test]
    fn get_tables_schema_toggles_table_schema_column() {
        assert_eq!(schema_get_tables(false).fields().len(), 4);
        assert_eq!(schema_get_tables(true).fields().len(), 5);
    }
}
