//! On-disk layout of a hub installation.

use std::path::{Path, PathBuf};

/// Directory names under `data/` that belong to the hub itself.
pub const RESERVED_DATA_DIRS: [&str; 2] = ["hub", "backups"];

/// Directory the accessory engine installs its extensions into.
pub const EXTENSIONS_DIR: &str = "node_modules";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("bridges.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn layout_file(&self) -> PathBuf {
        self.root.join("layout.json")
    }

    /// Parent of every worker state directory.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn bridge_dir(&self, id: &str) -> PathBuf {
        self.data_dir().join(id)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir().join("backups")
    }

    pub fn accessories_cache(&self, id: &str) -> PathBuf {
        self.root.join("accessories").join(id)
    }

    pub fn pairing_cache(&self, id: &str) -> PathBuf {
        self.root.join("persist").join(id)
    }

    pub fn bridge_config(&self, id: &str) -> PathBuf {
        self.root.join("config").join(format!("{id}.json"))
    }

    pub fn extensions_dir(&self, id: &str) -> PathBuf {
        self.bridge_dir(id).join(EXTENSIONS_DIR)
    }

    /// Every artifact `uninstall` has to remove for a bridge.
    pub fn bridge_artifacts(&self, id: &str) -> [PathBuf; 4] {
        [
            self.bridge_dir(id),
            self.accessories_cache(id),
            self.pairing_cache(id),
            self.bridge_config(id),
        ]
    }
}
