//! Source-level type metadata (entities and properties from an ORM or content contract).
//!
//! Correlation is purely by name. Nothing here is required for correctness; matched
//! metadata only sharpens error messages and type hints.

use crate::catalog::schema::TableSchema;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourcePropertyInfo {
    pub name: String,
    pub type_name: String,
    /// Explicit column mapping, when the source declares one.
    #[serde(default)]
    pub column_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceEntityInfo {
    pub name: String,
    /// Explicit table mapping, when the source declares one.
    #[serde(default)]
    pub table_name: Option<String>,
    pub properties: Vec<SourcePropertyInfo>,
    /// Properties that matched no column of the table.
    #[serde(default)]
    pub unmatched_properties: Vec<String>,
}

pub trait SourceMetadataProvider: Send + Sync {
    fn entities(&self, database_id: &str) -> Result<Vec<SourceEntityInfo>, EngineError>;
}

/// Lowercases and drops `_`, so `UserProfile`, `user_profile` and `userprofile` collide.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn entity_matches(entity: &SourceEntityInfo, table: &str) -> bool {
    match &entity.table_name {
        Some(explicit) => explicit.eq_ignore_ascii_case(table),
        None => {
            let entity_name = normalize(&entity.name);
            let table_name = normalize(table);
            entity_name == table_name
                || format!("{entity_name}s") == table_name
                || format!("{entity_name}es") == table_name
        }
    }
}

fn property_matches(prop: &SourcePropertyInfo, column: &str) -> bool {
    match &prop.column_name {
        Some(explicit) => explicit.eq_ignore_ascii_case(column),
        None => normalize(&prop.name) == normalize(column),
    }
}

/// Attaches entity/property info to matching tables and columns.
///
/// Returns the entities that matched no table. Unmatched columns keep
/// `source_property = None`; unmatched properties are listed on the entity.
pub fn merge_source_metadata<'a>(
    tables: impl Iterator<Item = &'a mut TableSchema>,
    entities: Vec<SourceEntityInfo>,
) -> Vec<SourceEntityInfo> {
    let mut remaining = entities;
    for table in tables {
        let Some(pos) = remaining.iter().position(|e| entity_matches(e, &table.name)) else {
            continue;
        };
        let mut entity = remaining.swap_remove(pos);
        let mut unmatched = Vec::new();
        for prop in &entity.properties {
            match table
                .columns
                .iter_mut()
                .find(|c| c.source_property.is_none() && property_matches(prop, &c.name))
            {
                Some(column) => column.source_property = Some(prop.clone()),
                None => unmatched.push(prop.name.clone()),
            }
        }
        entity.unmatched_properties = unmatched;
        table.source_entity = Some(entity);
    }
    remaining
}
