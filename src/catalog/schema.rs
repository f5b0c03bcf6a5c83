use crate::catalog::source::{SourceEntityInfo, SourcePropertyInfo};
use crate::catalog::types::{StorageType, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DatabaseKind {
    DirectSql,
    OrmBacked,
    ContentInterface,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub declared_type: String,
    pub storage_type: StorageType,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_auto_increment: bool,
    #[serde(default)]
    pub source_property: Option<SourcePropertyInfo>,
}

impl ColumnSchema {
    /// Insert may omit the column without tripping NOT NULL.
    pub fn may_be_omitted(&self) -> bool {
        self.nullable || self.default_value.is_some() || self.is_auto_increment
    }

    /// Name used in caller-facing messages: `age (Person.age: Int)` when source info exists.
    pub fn display_name(&self) -> String {
        match &self.source_property {
            Some(prop) => format!("{} ({}: {})", self.name, prop.name, prop.type_name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub where_clause: Option<String>,
    pub cardinality: Option<u64>,
}

impl IndexSchema {
    pub fn is_partial(&self) -> bool {
        self.where_clause.is_some()
    }

    pub fn leading_column(&self) -> Option<&str> {
        self.columns.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ForeignKeyAction {
    NoAction,
    Restrict,
    SetNull,
    SetDefault,
    Cascade,
}

impl ForeignKeyAction {
    pub fn parse(raw: &str) -> ForeignKeyAction {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RESTRICT" => ForeignKeyAction::Restrict,
            "SET NULL" => ForeignKeyAction::SetNull,
            "SET DEFAULT" => ForeignKeyAction::SetDefault,
            "CASCADE" => ForeignKeyAction::Cascade,
            _ => ForeignKeyAction::NoAction,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyConstraint {
    pub from_table: String,
    pub from_columns: Vec<String>,
    pub to_table: String,
    /// Empty when the declaration references the parent's primary key implicitly.
    pub to_columns: Vec<String>,
    pub on_delete_action: ForeignKeyAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckConstraint {
    pub name: Option<String>,
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewSchema {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: BTreeSet<String>,
    pub foreign_keys: Vec<ForeignKeyConstraint>,
    pub check_constraints: Vec<CheckConstraint>,
    /// Has an implicit rowid (not a WITHOUT ROWID table).
    pub has_rowid: bool,
    #[serde(default)]
    pub source_entity: Option<SourceEntityInfo>,
    pub estimated_row_count: Option<u64>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|pk| pk.eq_ignore_ascii_case(name))
    }

    /// The single INTEGER PRIMARY KEY column aliasing rowid, if any.
    pub fn rowid_alias(&self) -> Option<&ColumnSchema> {
        if !self.has_rowid || self.primary_key.len() != 1 {
            return None;
        }
        self.columns
            .iter()
            .find(|c| self.is_primary_key(&c.name) && c.is_auto_increment)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Immutable, versioned snapshot of one database's catalog.
///
/// Published behind an `Arc`; a refresh builds a new value and swaps the pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedDatabaseSchema {
    pub database_id: String,
    pub kind: DatabaseKind,
    pub tables: BTreeMap<String, TableSchema>,
    pub views: BTreeMap<String, ViewSchema>,
    pub indexes: Vec<IndexSchema>,
    pub foreign_keys: Vec<ForeignKeyConstraint>,
    pub schema_version: u64,
    pub last_refreshed_at_micros: u64,
    /// Source entities that matched no table. Kept so callers can see the drift.
    pub unmatched_entities: Vec<SourceEntityInfo>,
}

impl CachedDatabaseSchema {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name).or_else(|| {
            self.tables
                .values()
                .find(|t| t.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn view(&self, name: &str) -> Option<&ViewSchema> {
        self.views.get(name).or_else(|| {
            self.views
                .values()
                .find(|v| v.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn indexes_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a IndexSchema> + 'a {
        self.indexes
            .iter()
            .filter(move |idx| idx.table_name.eq_ignore_ascii_case(table))
    }

    /// True if `columns` are exactly the table's primary key or a non-partial unique index.
    pub fn is_unique_key(&self, table: &str, columns: &[String]) -> bool {
        let Some(schema) = self.table(table) else {
            return false;
        };
        let wanted: BTreeSet<String> = columns.iter().map(|c| c.to_ascii_lowercase()).collect();
        let pk: BTreeSet<String> = schema
            .primary_key
            .iter()
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if !pk.is_empty() && pk == wanted {
            return true;
        }
        self.indexes_for(table).any(|idx| {
            idx.unique
                && !idx.is_partial()
                && idx
                    .columns
                    .iter()
                    .map(|c| c.to_ascii_lowercase())
                    .collect::<BTreeSet<_>>()
                    == wanted
        })
    }
}

/// Default value parsed from the catalog's textual default, when it is a plain literal.
pub fn literal_default(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("NULL") {
        return Some(Value::Null);
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return Some(Value::Integer(v));
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(Value::Real(v));
    }
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        let inner = &trimmed[1..trimmed.len() - 1];
        return Some(Value::text(inner.replace("''", "'")));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, ty: &str, nullable: bool) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            declared_type: ty.into(),
            storage_type: StorageType::from_declared(ty),
            nullable,
            default_value: None,
            is_auto_increment: false,
            source_property: None,
        }
    }

    #[test]
    fn unique_key_detection_covers_pk_and_unique_indexes() {
        let mut tables = BTreeMap::new();
        tables.insert(
            "users".to_string(),
            TableSchema {
                name: "users".into(),
                columns: vec![column("id", "INTEGER", false), column("email", "TEXT", true)],
                primary_key: BTreeSet::from(["id".to_string()]),
                foreign_keys: Vec::new(),
                check_constraints: Vec::new(),
                has_rowid: true,
                source_entity: None,
                estimated_row_count: Some(3),
            },
        );
        let schema = CachedDatabaseSchema {
            database_id: "main".into(),
            kind: DatabaseKind::DirectSql,
            tables,
            views: BTreeMap::new(),
            indexes: vec![IndexSchema {
                name: "users_email".into(),
                table_name: "users".into(),
                columns: vec!["email".into()],
                unique: true,
                where_clause: None,
                cardinality: None,
            }],
            foreign_keys: Vec::new(),
            schema_version: 1,
            last_refreshed_at_micros: 0,
            unmatched_entities: Vec::new(),
        };
        assert!(schema.is_unique_key("users", &["id".into()]));
        assert!(schema.is_unique_key("USERS", &["Email".into()]));
        assert!(!schema.is_unique_key("users", &["id".into(), "email".into()]));
        assert!(schema.table("Users").is_some());
    }

    #[test]
    fn literal_defaults_parse() {
        assert_eq!(literal_default("0"), Some(Value::Integer(0)));
        assert_eq!(literal_default("'it''s'"), Some(Value::text("it's")));
        assert_eq!(literal_default("CURRENT_TIMESTAMP"), None);
    }
}
