pub mod converter;
pub mod table;
pub mod types;

#[cfg(test)]
mod type_mapper_tests;

pub use converter::{
    convert, live_view_name, render_create_database, render_create_statement,
    render_drop_statement, render_drop_view_statement, render_view_statement, TargetColumn,
    TargetTableSchema, DELETED_COLUMN, VERSION_COLUMN,
};
pub use table::{validate_identifier, ColumnDescriptor, TableSchema};
pub use types::{map_type, SourceKind, SourceType, TargetType};
