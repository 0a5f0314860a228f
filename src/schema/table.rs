use crate::schema::types::SourceType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One source column, derived once per table per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub source_type: SourceType,
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, source_type: SourceType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            source_type,
            nullable,
        }
    }
}

/// Source table as reported by introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
        primary_key: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key,
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Checks the structural invariants: at least one column, unique column
    /// names, and every primary key column present in the column list.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::schema(&self.name, "table has no columns"));
        }

        let mut seen = HashSet::with_capacity(self.columns.len());
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(Error::schema(
                    &self.name,
                    format!("duplicate column '{}'", column.name),
                ));
            }
        }

        for key in &self.primary_key {
            if !seen.contains(key.as_str()) {
                return Err(Error::schema(
                    &self.name,
                    format!("primary key column '{}' is not a column of the table", key),
                ));
            }
        }

        Ok(())
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`. Identifiers are interpolated into SQL
/// on both sides, so anything else is refused.
pub fn validate_identifier(name: &str, context: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else if name.is_empty() {
        Err(Error::Config(format!("Empty {} is not allowed", context)))
    } else {
        Err(Error::Config(format!(
            "Invalid {} '{}': must contain only alphanumeric characters and underscores, \
             and start with a letter or underscore",
            context, name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str) -> ColumnDescriptor {
        ColumnDescriptor::new(name, SourceType::new("int"), false)
    }

    #[test]
    fn test_valid_table() {
        let table = TableSchema::new(
            "users",
            vec![column("id"), column("name")],
            vec!["id".to_string()],
        );
        assert!(table.validate().is_ok());
        assert_eq!(table.column_names(), vec!["id", "name"]);
    }

    #[test]
    fn test_zero_columns_rejected() {
        let table = TableSchema::new("empty", vec![], vec![]);
        let err = table.validate().unwrap_err();
        assert!(matches!(err, Error::Schema { ref table, .. } if table == "empty"));
    }

    #[test]
    fn test_unknown_primary_key_rejected() {
        let table = TableSchema::new("users", vec![column("id")], vec!["uuid".to_string()]);
        let err = table.validate().unwrap_err();
        assert!(err.to_string().contains("uuid"));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let table = TableSchema::new("users", vec![column("id"), column("id")], vec![]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("users", "table name").is_ok());
        assert!(validate_identifier("_tmp_2024", "table name").is_ok());
        assert!(validate_identifier("", "table name").is_err());
        assert!(validate_identifier("1users", "table name").is_err());
        assert!(validate_identifier("users; DROP TABLE x", "table name").is_err());
        assert!(validate_identifier("my`table", "table name").is_err());
    }
}
