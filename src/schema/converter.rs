//! Target table definitions and ClickHouse DDL.
//!
//! [`convert`] turns a [`TableSchema`] into a [`TargetTableSchema`]. In CDC
//! mode the target gets two trailing bookkeeping columns, [`VERSION_COLUMN`]
//! and [`DELETED_COLUMN`], and is created with
//! `ReplacingMergeTree(_version)`: rows sharing a sorting key collapse to the
//! one with the highest `_version` when read with `FINAL`. The companion
//! `<table>_live` view hides soft-deleted rows.

use crate::schema::table::{ColumnDescriptor, TableSchema};
use crate::schema::types::{map_type, TargetType};
use crate::{Error, Result};

pub const VERSION_COLUMN: &str = "_version";
pub const DELETED_COLUMN: &str = "_deleted";

const LIVE_VIEW_SUFFIX: &str = "_live";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: String,
    pub target_type: TargetType,
    pub nullable: bool,
}

impl TargetColumn {
    pub fn new(name: impl Into<String>, target_type: TargetType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            target_type,
            nullable,
        }
    }

    /// Full column type, `Nullable(...)` wrapped when the column is nullable.
    pub fn type_name(&self) -> String {
        if self.nullable {
            format!("Nullable({})", self.target_type)
        } else {
            self.target_type.to_string()
        }
    }

    /// Placeholder for a missing value.
    pub fn default_value(&self) -> serde_json::Value {
        if self.nullable {
            serde_json::Value::Null
        } else {
            self.target_type.default_value()
        }
    }
}

impl From<&ColumnDescriptor> for TargetColumn {
    fn from(column: &ColumnDescriptor) -> Self {
        TargetColumn::new(
            column.name.clone(),
            map_type(&column.source_type),
            column.nullable,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTableSchema {
    pub name: String,
    /// Converted source columns followed, in CDC mode, by `_version` and
    /// `_deleted`.
    pub columns: Vec<TargetColumn>,
    pub primary_key: Vec<String>,
    pub cdc: bool,
}

impl TargetTableSchema {
    /// All column names in write order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Converted source columns only.
    pub fn source_columns(&self) -> &[TargetColumn] {
        if self.cdc {
            &self.columns[..self.columns.len().saturating_sub(2)]
        } else {
            &self.columns
        }
    }

    fn order_by(&self) -> (String, bool) {
        if !self.primary_key.is_empty() {
            let keys = self
                .primary_key
                .iter()
                .map(|k| quote(k))
                .collect::<Vec<_>>()
                .join(", ");
            return (keys, false);
        }

        match self.columns.first() {
            Some(first) => (quote(&first.name), first.nullable),
            None => ("tuple()".to_string(), false),
        }
    }
}

/// Builds the target definition of `table`.
///
/// Fails when the table has no columns, a primary key column is missing,
/// column names repeat, or (in CDC mode) a source column already uses one of
/// the bookkeeping names.
pub fn convert(table: &TableSchema, cdc: bool) -> Result<TargetTableSchema> {
    table.validate()?;

    let mut columns: Vec<TargetColumn> = table.columns.iter().map(TargetColumn::from).collect();

    if cdc {
        for reserved in [VERSION_COLUMN, DELETED_COLUMN] {
            if table.column(reserved).is_some() {
                return Err(Error::schema(
                    &table.name,
                    format!("column '{}' collides with a CDC bookkeeping column", reserved),
                ));
            }
        }
        columns.push(TargetColumn::new(VERSION_COLUMN, TargetType::UInt64, false));
        columns.push(TargetColumn::new(DELETED_COLUMN, TargetType::UInt8, false));
    }

    Ok(TargetTableSchema {
        name: table.name.clone(),
        columns,
        primary_key: table.primary_key.clone(),
        cdc,
    })
}

pub fn live_view_name(table: &str) -> String {
    format!("{}{}", table, LIVE_VIEW_SUFFIX)
}

pub fn render_create_database(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {}", quote(database))
}

pub fn render_create_statement(target: &TargetTableSchema, database: &str) -> String {
    let columns_sql = target
        .columns
        .iter()
        .map(|c| format!("    {} {}", quote(&c.name), c.type_name()))
        .collect::<Vec<_>>()
        .join(",\n");

    let engine = if target.cdc {
        format!("ReplacingMergeTree({})", VERSION_COLUMN)
    } else {
        "MergeTree()".to_string()
    };

    let (order_by, nullable_key) = target.order_by();

    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {}.{}\n(\n{}\n)\nENGINE = {}\nORDER BY ({})",
        quote(database),
        quote(&target.name),
        columns_sql,
        engine,
        order_by
    );
    if nullable_key {
        sql.push_str("\nSETTINGS allow_nullable_key = 1");
    }
    sql
}

/// Live view over a CDC table; `None` for snapshot-only tables.
pub fn render_view_statement(target: &TargetTableSchema, database: &str) -> Option<String> {
    if !target.cdc {
        return None;
    }

    let columns = target
        .source_columns()
        .iter()
        .map(|c| quote(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    Some(format!(
        "CREATE OR REPLACE VIEW {}.{} AS\nSELECT {}\nFROM {}.{} FINAL\nWHERE {} = 0",
        quote(database),
        quote(&live_view_name(&target.name)),
        columns,
        quote(database),
        quote(&target.name),
        DELETED_COLUMN
    ))
}

pub fn render_drop_statement(table: &str, database: &str) -> String {
    format!("DROP TABLE IF EXISTS {}.{}", quote(database), quote(table))
}

pub fn render_drop_view_statement(table: &str, database: &str) -> String {
    format!(
        "DROP VIEW IF EXISTS {}.{}",
        quote(database),
        quote(&live_view_name(table))
    )
}

fn quote(identifier: &str) -> String {
    format!("`{}`", identifier)
}
