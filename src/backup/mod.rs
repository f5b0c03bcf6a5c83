//! Pre-mutation backups and their manifests.
//!
//! A backup is a standalone store file written by the driver. Next to it sits
//! `<file>.manifest.json`, which records what was copied and the file's SHA-256.

use crate::driver::BackupScope;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

pub const MANIFEST_SUFFIX: &str = ".manifest.json";
const BACKUP_EXTENSION: &str = "sqlite";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "table", rename_all = "snake_case")]
pub enum ManifestScope {
    Table(String),
    Database,
}

impl From<&BackupScope> for ManifestScope {
    fn from(scope: &BackupScope) -> Self {
        match scope {
            BackupScope::Table(table) => ManifestScope::Table(table.clone()),
            BackupScope::Database => ManifestScope::Database,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub backup_id: String,
    pub database_id: String,
    pub scope: ManifestScope,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub row_count: Option<u64>,
    pub created_at_micros: u64,
    /// File name of the backup, relative to the manifest's directory.
    pub file: String,
    pub sha256: String,
    pub engine_version: String,
}

impl BackupManifest {
    /// Whether this backup can restore `table`.
    pub fn covers(&self, table: &str) -> bool {
        match &self.scope {
            ManifestScope::Table(name) => name.eq_ignore_ascii_case(table),
            ManifestScope::Database => true,
        }
    }
}

/// Reduces an identifier to characters that are safe in a file name.
fn file_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

pub fn manifest_path(backup: &Path) -> PathBuf {
    let mut name = backup.as_os_str().to_os_string();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

pub fn sha256_file_hex(path: &Path) -> Result<String, EngineError> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Allocates backup file paths under a root directory and seals them with manifests.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh, not yet existing path for a backup of `scope`.
    pub fn allocate(&self, database_id: &str, scope: &BackupScope) -> Result<PathBuf, EngineError> {
        let dir = self.root.join(file_component(database_id));
        crate::create_private_dir_all(&dir)?;
        let label = match scope {
            BackupScope::Table(table) => file_component(table),
            BackupScope::Database => "database".to_string(),
        };
        let name = format!(
            "{}-{}-{label}.{BACKUP_EXTENSION}",
            crate::catalog::now_micros(),
            Uuid::new_v4().simple()
        );
        Ok(dir.join(name))
    }

    /// Hashes a written backup and records its manifest beside it.
    pub fn seal(
        &self,
        path: &Path,
        database_id: &str,
        scope: &BackupScope,
        transaction_id: Option<&str>,
        row_count: Option<u64>,
    ) -> Result<BackupManifest, EngineError> {
        if !path.is_file() {
            return Err(EngineError::Backup(format!(
                "backup file was not written: {}",
                path.display()
            )));
        }
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::Backup(format!("bad backup path: {}", path.display())))?;
        let manifest = BackupManifest {
            backup_id: Uuid::new_v4().to_string(),
            database_id: database_id.to_string(),
            scope: ManifestScope::from(scope),
            transaction_id: transaction_id.map(str::to_string),
            row_count,
            created_at_micros: crate::catalog::now_micros(),
            file,
            sha256: sha256_file_hex(path)?,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_manifest(path, &manifest)?;
        info!(
            database_id,
            backup = %path.display(),
            row_count = ?row_count,
            "backup written"
        );
        Ok(manifest)
    }
}

fn write_manifest(backup: &Path, manifest: &BackupManifest) -> Result<(), EngineError> {
    let bytes =
        serde_json::to_vec_pretty(manifest).map_err(|e| EngineError::Encode(e.to_string()))?;
    let target = manifest_path(backup);
    let tmp = target.with_extension("json.tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, &target)?;
    Ok(())
}

pub fn load_manifest(manifest_file: &Path) -> Result<BackupManifest, EngineError> {
    let bytes = fs::read(manifest_file)?;
    let manifest: BackupManifest =
        serde_json::from_slice(&bytes).map_err(|e| EngineError::Decode(e.to_string()))?;
    if manifest.sha256.len() != 64 || !manifest.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::Backup(format!(
            "manifest {} carries a malformed digest",
            manifest_file.display()
        )));
    }
    if manifest.file.contains(['/', '\\']) || manifest.file.starts_with('.') {
        return Err(EngineError::Backup(format!(
            "manifest {} points outside its directory",
            manifest_file.display()
        )));
    }
    Ok(manifest)
}

/// The backup file a manifest describes.
pub fn backup_file_for(manifest_file: &Path, manifest: &BackupManifest) -> PathBuf {
    manifest_file
        .parent()
        .map(|dir| dir.join(&manifest.file))
        .unwrap_or_else(|| PathBuf::from(&manifest.file))
}

/// Recomputes the backup's digest and compares it with the manifest.
pub fn verify_backup(manifest_file: &Path) -> Result<BackupManifest, EngineError> {
    let manifest = load_manifest(manifest_file)?;
    let file = backup_file_for(manifest_file, &manifest);
    let actual = sha256_file_hex(&file)?;
    if !actual.eq_ignore_ascii_case(&manifest.sha256) {
        return Err(EngineError::Backup(format!(
            "checksum mismatch for {}: expected {}, found {actual}",
            file.display(),
            manifest.sha256
        )));
    }
    Ok(manifest)
}

/// Every manifest under `root`, oldest first.
pub fn list_backups(root: &Path) -> Result<Vec<(PathBuf, BackupManifest)>, EngineError> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for db_dir in fs::read_dir(root)? {
        let db_dir = db_dir?.path();
        if !db_dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&db_dir)? {
            let path = entry?.path();
            let is_manifest = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
            if is_manifest {
                let manifest = load_manifest(&path)?;
                out.push((path, manifest));
            }
        }
    }
    out.sort_by(|a, b| {
        a.1.created_at_micros
            .cmp(&b.1.created_at_micros)
            .then_with(|| a.0.cmp(&b.0))
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sealed_backup_verifies_until_tampered() {
        let dir = tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let scope = BackupScope::Table("orders".into());
        let path = store.allocate("main/db", &scope).unwrap();
        assert!(path.starts_with(dir.path().join("main_db")));
        fs::write(&path, b"pretend store file").unwrap();

        let manifest = store.seal(&path, "main/db", &scope, Some("tx-1"), Some(3)).unwrap();
        assert!(manifest.covers("ORDERS"));
        assert!(!manifest.covers("users"));

        let manifest_file = manifest_path(&path);
        assert_eq!(verify_backup(&manifest_file).unwrap(), manifest);

        let listed = list_backups(dir.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.transaction_id.as_deref(), Some("tx-1"));

        fs::write(&path, b"changed").unwrap();
        assert!(matches!(
            verify_backup(&manifest_file),
            Err(EngineError::Backup(_))
        ));
    }

    #[test]
    fn sealing_a_missing_file_fails() {
        let dir = tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let path = store.allocate("db", &BackupScope::Database).unwrap();
        assert!(store.seal(&path, "db", &BackupScope::Database, None, None).is_err());
    }

    #[test]
    fn listing_an_absent_root_is_empty() {
        let dir = tempdir().unwrap();
        assert!(list_backups(&dir.path().join("nothing")).unwrap().is_empty());
    }
}
