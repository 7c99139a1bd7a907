//! Backup archive format: a zip with a `meta` descriptor and a worker's
//! state directory tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{HubError, Result};
use crate::paths::{Paths, EXTENSIONS_DIR};
use crate::registry::BridgeRecord;

pub const META_ENTRY: &str = "meta";
pub const PRODUCT: &str = "bridgehub";

/// Names never copied into an archive, at any depth.
const EXCLUDED_DIRS: [&str; 2] = [EXTENSIONS_DIR, "cache"];
const EXCLUDED_FILES: [&str; 1] = ["config.json"];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Bridge,
    Full,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArchiveMeta {
    /// Milliseconds since the epoch
    pub date: i64,
    #[serde(rename = "type")]
    pub kind: ArchiveKind,
    pub data: Value,
    pub product: String,
    pub generator: String,
    pub version: String,
}

impl ArchiveMeta {
    pub fn bridge(record: &BridgeRecord) -> Result<Self> {
        Ok(Self {
            date: chrono::Utc::now().timestamp_millis(),
            kind: ArchiveKind::Bridge,
            data: serde_json::to_value(record)?,
            product: PRODUCT.to_string(),
            generator: PRODUCT.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

/// Write `record`'s state directory to `out`. Returns the number of files.
pub fn export_bridge(paths: &Paths, record: &BridgeRecord, out: &Path) -> Result<usize> {
    let source = paths.bridge_dir(&record.id);
    if !source.is_dir() {
        return Err(HubError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no state directory for bridge '{}'", record.id),
        )));
    }
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(File::create(out)?);

    zip.start_file(META_ENTRY, options)?;
    zip.write_all(&serde_json::to_vec_pretty(&ArchiveMeta::bridge(record)?)?)?;

    let mut files = 0;
    add_tree(&mut zip, &source, "", options, &mut files)?;
    zip.finish()?;

    info!(bridge = %record.id, files, out = %out.display(), "Bridge exported");
    Ok(files)
}

fn add_tree(
    zip: &mut ZipWriter<File>,
    dir: &Path,
    prefix: &str,
    options: FileOptions,
    files: &mut usize,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_name = format!("{prefix}{name}");
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if EXCLUDED_DIRS.contains(&name.as_str()) {
                debug!(entry = %entry_name, "Skipping excluded directory");
                continue;
            }
            zip.add_directory(format!("{entry_name}/"), options)?;
            add_tree(zip, &entry.path(), &format!("{entry_name}/"), options, files)?;
        } else if file_type.is_file() {
            if EXCLUDED_FILES.contains(&name.as_str()) {
                continue;
            }
            zip.start_file(entry_name, options)?;
            let mut content = Vec::new();
            File::open(entry.path())?.read_to_end(&mut content)?;
            zip.write_all(&content)?;
            *files += 1;
        }
    }
    Ok(())
}

/// Read the `meta` descriptor of an archive.
pub fn read_meta(archive: &Path) -> Result<ArchiveMeta> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let entry = zip.by_name(META_ENTRY)?;
    Ok(serde_json::from_reader(entry)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn export_skips_excluded_entries() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let mut registry = Registry::load(paths.clone(), false);
        let record = registry
            .create("Kitchen", 51828, "031-45-154", None, "bonjour")
            .unwrap();

        let state = paths.bridge_dir("kitchen");
        fs::create_dir_all(state.join("accessories")).unwrap();
        fs::create_dir_all(state.join("node_modules/some-plugin")).unwrap();
        fs::create_dir_all(state.join("cache")).unwrap();
        fs::write(state.join("accessories/cached.json"), "[]").unwrap();
        fs::write(state.join("node_modules/some-plugin/index.js"), "x").unwrap();
        fs::write(state.join("cache/blob"), "x").unwrap();
        fs::write(state.join("config.json"), "{}").unwrap();
        fs::write(state.join("package.json"), "{}").unwrap();

        let out = dir.path().join("backups/kitchen.zip");
        assert_eq!(export_bridge(&paths, &record, &out).unwrap(), 2);

        let mut zip = ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let names: Vec<String> = zip.file_names().map(str::to_string).collect();
        assert!(names.contains(&"accessories/cached.json".to_string()));
        assert!(names.contains(&"package.json".to_string()));
        assert!(!names.iter().any(|n| n.contains("node_modules")));
        assert!(!names.iter().any(|n| n.starts_with("cache")));
        assert!(!names.contains(&"config.json".to_string()));
        assert!(zip.by_name(META_ENTRY).is_ok());

        let meta = read_meta(&out).unwrap();
        assert_eq!(meta.kind, ArchiveKind::Bridge);
        assert_eq!(meta.product, PRODUCT);
        assert_eq!(meta.data["id"], "kitchen");
    }

    #[test]
    fn export_without_state_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let mut registry = Registry::load(paths.clone(), false);
        let record = registry
            .create("Garage", 51829, "031-45-154", None, "bonjour")
            .unwrap();

        let err = export_bridge(&paths, &record, &dir.path().join("out.zip")).unwrap_err();
        assert!(matches!(err, HubError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn meta_uses_type_key() {
        let meta = ArchiveMeta {
            date: 0,
            kind: ArchiveKind::Full,
            data: Value::Null,
            product: PRODUCT.into(),
            generator: PRODUCT.into(),
            version: "1.0.0".into(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "full");
    }
}
