use crate::catalog::schema::{
    CachedDatabaseSchema, ColumnSchema, DatabaseKind, ForeignKeyAction, ForeignKeyConstraint,
    IndexSchema, TableSchema, ViewSchema,
};
use crate::catalog::source::{SourceEntityInfo, merge_source_metadata};
use crate::catalog::types::StorageType;
use crate::driver::{RawTable, StoreCatalog};
use crate::query::sql::extract_check_constraints;
use std::collections::{BTreeMap, BTreeSet};

/// Builds a snapshot from the driver's raw catalog plus optional source metadata.
pub fn build_snapshot(
    database_id: &str,
    kind: DatabaseKind,
    catalog: StoreCatalog,
    entities: Vec<SourceEntityInfo>,
    schema_version: u64,
    now_micros: u64,
) -> CachedDatabaseSchema {
    let mut tables = BTreeMap::new();
    let mut indexes = Vec::new();
    let mut foreign_keys = Vec::new();

    for raw in catalog.tables {
        let (table, table_indexes) = build_table(raw);
        foreign_keys.extend(table.foreign_keys.iter().cloned());
        indexes.extend(table_indexes);
        tables.insert(table.name.clone(), table);
    }

    let unmatched_entities = merge_source_metadata(tables.values_mut(), entities);

    let views = catalog
        .views
        .into_iter()
        .map(|v| {
            (
                v.name.clone(),
                ViewSchema {
                    name: v.name,
                    sql: v.sql,
                },
            )
        })
        .collect();

    CachedDatabaseSchema {
        database_id: database_id.to_string(),
        kind,
        tables,
        views,
        indexes,
        foreign_keys,
        schema_version,
        last_refreshed_at_micros: now_micros,
        unmatched_entities,
    }
}

fn build_table(raw: RawTable) -> (TableSchema, Vec<IndexSchema>) {
    let has_rowid = !raw.without_rowid;
    let mut pk_columns: Vec<(u32, String)> = raw
        .columns
        .iter()
        .filter(|c| c.pk_position > 0)
        .map(|c| (c.pk_position, c.name.clone()))
        .collect();
    pk_columns.sort();
    // INTEGER PRIMARY KEY on a rowid table aliases the rowid and is assigned on insert.
    let rowid_alias = match pk_columns.as_slice() {
        [(_, name)] if has_rowid => raw
            .columns
            .iter()
            .find(|c| &c.name == name && c.declared_type.eq_ignore_ascii_case("INTEGER"))
            .map(|c| c.name.clone()),
        _ => None,
    };

    let columns = raw
        .columns
        .into_iter()
        .map(|c| {
            let is_auto_increment = rowid_alias.as_deref() == Some(c.name.as_str());
            ColumnSchema {
                storage_type: StorageType::from_declared(&c.declared_type),
                nullable: !c.not_null && !is_auto_increment,
                declared_type: c.declared_type,
                default_value: c.default_value,
                is_auto_increment,
                source_property: None,
                name: c.name,
            }
        })
        .collect();

    let foreign_keys = raw
        .foreign_keys
        .into_iter()
        .map(|fk| ForeignKeyConstraint {
            from_table: raw.name.clone(),
            from_columns: fk.from_columns,
            to_table: fk.to_table,
            to_columns: fk.to_columns,
            on_delete_action: ForeignKeyAction::parse(&fk.on_delete),
        })
        .collect();

    let indexes = raw
        .indexes
        .into_iter()
        .map(|idx| IndexSchema {
            name: idx.name,
            table_name: raw.name.clone(),
            columns: idx.columns,
            unique: idx.unique,
            where_clause: idx.where_clause,
            cardinality: idx.cardinality,
        })
        .collect();

    let check_constraints = raw
        .create_sql
        .as_deref()
        .map(extract_check_constraints)
        .unwrap_or_default();

    let table = TableSchema {
        name: raw.name,
        columns,
        primary_key: pk_columns.into_iter().map(|(_, name)| name).collect::<BTreeSet<_>>(),
        foreign_keys,
        check_constraints,
        has_rowid,
        source_entity: None,
        estimated_row_count: raw.row_count,
    };
    (table, indexes)
}
