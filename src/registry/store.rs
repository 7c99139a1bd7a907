use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, info, trace, warn};

use super::record::{resolve_username, sanitize_id, BridgeKind, BridgeRecord, PortRange, HUB_ID};
use crate::error::{HubError, Result};
use crate::paths::Paths;

/// Persisted list of bridge records, the desired state of the fleet.
///
/// Mutations are not internally synchronised; callers share one instance
/// behind a lock and serialise writes through it.
pub struct Registry {
    paths: Paths,
    dev_mode: bool,
    records: Vec<BridgeRecord>,
}

impl Registry {
    /// Load the registry file; a missing or corrupt file yields an empty fleet.
    pub fn load(paths: Paths, dev_mode: bool) -> Self {
        let mut records = read_records(&paths.registry_file());
        normalize(&mut records);
        debug!(count = records.len(), "Registry loaded");

        Self {
            paths,
            dev_mode,
            records,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Records in persisted order, `hub` first; `dev` records only in dev mode.
    pub fn list(&self) -> Vec<BridgeRecord> {
        self.records
            .iter()
            .filter(|r| self.dev_mode || r.kind != BridgeKind::Dev)
            .cloned()
            .collect()
    }

    /// Every persisted id regardless of mode; state of hidden records is kept.
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&BridgeRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn create(
        &mut self,
        name: &str,
        port: u16,
        pin: &str,
        username: Option<&str>,
        advertiser: &str,
    ) -> Result<BridgeRecord> {
        let id = sanitize_id(name);
        if id.is_empty() {
            return Err(HubError::InvalidName(name.to_string()));
        }
        if self.get(&id).is_some() {
            return Err(HubError::DuplicateId(id));
        }
        self.check_port(port, None)?;

        let record = BridgeRecord {
            kind: if id == HUB_ID {
                BridgeKind::Hub
            } else {
                BridgeKind::Bridge
            },
            username: resolve_username(&id, username),
            id,
            display: name.trim().to_string(),
            port,
            pin: pin.to_string(),
            ports: None,
            autostart: 0,
            advertiser: advertiser.to_string(),
        };

        let mut records = self.records.clone();
        records.push(record.clone());
        self.commit(records)?;

        info!(bridge = %record.id, port = record.port, "Bridge created");
        Ok(record)
    }

    /// Create the control-plane entry if it does not exist yet.
    pub fn ensure_hub(&mut self, port: u16, pin: &str) -> Result<BridgeRecord> {
        if let Some(hub) = self.get(HUB_ID) {
            return Ok(hub.clone());
        }
        self.create(HUB_ID, port, pin, None, super::record::DEFAULT_ADVERTISER)
    }

    /// Start an in-place update of an existing record.
    pub fn update(&mut self, id: &str) -> Result<RecordUpdate<'_>> {
        let index = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| HubError::NotFound(id.to_string()))?;
        Ok(RecordUpdate {
            registry: self,
            index,
        })
    }

    /// Remove a record and its on-disk artifacts. `false` if the id is unknown.
    pub fn uninstall(&mut self, id: &str) -> Result<bool> {
        if id == HUB_ID {
            return Err(HubError::Other(
                "the hub entry cannot be uninstalled".to_string(),
            ));
        }
        if self.get(id).is_none() {
            debug!(bridge = %id, "Uninstall of unknown bridge ignored");
            return Ok(false);
        }

        let records = self
            .records
            .iter()
            .filter(|r| r.id != id)
            .cloned()
            .collect();
        self.commit(records)?;

        for artifact in self.paths.bridge_artifacts(id) {
            if let Err(e) = remove_path(&artifact) {
                warn!(bridge = %id, path = %artifact.display(), "Failed to remove artifact: {}", e);
            }
        }

        info!(bridge = %id, "Bridge uninstalled");
        Ok(true)
    }

    fn check_port(&self, port: u16, except: Option<&str>) -> Result<()> {
        let owner = self
            .records
            .iter()
            .filter(|r| Some(r.id.as_str()) != except)
            .find(|r| r.port == port);

        match owner {
            Some(owner) => Err(HubError::PortInUse {
                port,
                owner: owner.id.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Persist `records` and adopt them only once they are on disk.
    fn commit(&mut self, mut records: Vec<BridgeRecord>) -> Result<()> {
        normalize(&mut records);
        write_records(&self.paths.registry_file(), &records)?;
        self.records = records;
        Ok(())
    }
}

/// Pending mutation of one record; consumed by `info` or `ports`.
pub struct RecordUpdate<'a> {
    registry: &'a mut Registry,
    index: usize,
}

impl RecordUpdate<'_> {
    pub fn info(
        self,
        display: Option<&str>,
        pin: Option<&str>,
        autostart: Option<u32>,
        advertiser: Option<&str>,
    ) -> Result<BridgeRecord> {
        let mut records = self.registry.records.clone();
        let record = &mut records[self.index];

        if let Some(display) = display.map(str::trim).filter(|d| !d.is_empty()) {
            record.display = display.to_string();
        }
        if let Some(pin) = pin {
            record.pin = pin.to_string();
        }
        if let Some(autostart) = autostart {
            record.autostart = autostart;
        }
        if let Some(advertiser) = advertiser {
            record.advertiser = advertiser.to_string();
        }

        let updated = record.clone();
        self.registry.commit(records)?;
        debug!(bridge = %updated.id, "Bridge info updated");
        Ok(updated)
    }

    pub fn ports(self, start: u16, end: u16) -> Result<BridgeRecord> {
        let range = PortRange { start, end };
        if start > end {
            return Err(HubError::InvalidRange { start, end });
        }
        if let Some(clash) = self.registry.records.iter().find(|r| range.contains(r.port)) {
            return Err(HubError::PortInUse {
                port: clash.port,
                owner: clash.id.clone(),
            });
        }

        let mut records = self.registry.records.clone();
        records[self.index].ports = Some(range);
        let updated = records[self.index].clone();
        self.registry.commit(records)?;
        debug!(bridge = %updated.id, start, end, "Bridge port range updated");
        Ok(updated)
    }
}

/// Drop duplicate ids (first wins) and move `hub` to the front.
fn normalize(records: &mut Vec<BridgeRecord>) {
    let mut seen = std::collections::HashSet::new();
    records.retain(|r| seen.insert(r.id.clone()));

    if let Some(pos) = records.iter().position(BridgeRecord::is_hub) {
        let hub = records.remove(pos);
        records.insert(0, hub);
    }
}

fn read_records(path: &Path) -> Vec<BridgeRecord> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!(path = %path.display(), "Registry file missing, starting empty");
            return Vec::new();
        }
        Err(e) => {
            warn!(path = %path.display(), "Registry unreadable, starting empty: {}", e);
            return Vec::new();
        }
    };

    match serde_json::from_str(&content) {
        Ok(records) => records,
        Err(e) => {
            warn!(path = %path.display(), "Registry corrupt, starting empty: {}", e);
            Vec::new()
        }
    }
}

/// Write-new-then-rename so a crash never leaves a half-written registry.
fn write_records(path: &Path, records: &[BridgeRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, records)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    trace!(path = %path.display(), count = records.len(), "Registry persisted");
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(Paths::new(dir.path()), false);
        (dir, registry)
    }

    #[test]
    fn create_list_uninstall_round_trip() {
        let (dir, mut registry) = registry();

        let record = registry
            .create("Kitchen", 51828, "031-45-154", Some("AA:BB:CC:DD:EE:FF"), "bonjour")
            .unwrap();
        assert_eq!(record.id, "kitchen");
        assert_eq!(record.kind, BridgeKind::Bridge);

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "kitchen");
        assert_eq!(list[0].port, 51828);

        let reloaded = Registry::load(Paths::new(dir.path()), false);
        assert_eq!(reloaded.list(), list);

        assert!(registry.uninstall("kitchen").unwrap());
        assert!(registry.list().iter().all(|r| r.id != "kitchen"));
        assert!(!registry.uninstall("kitchen").unwrap());
    }

    #[test]
    fn create_rejects_duplicate_id_and_port() {
        let (_dir, mut registry) = registry();
        registry
            .create("Kitchen", 51828, "031-45-154", None, "bonjour")
            .unwrap();

        assert!(matches!(
            registry.create("kitchen!", 51829, "031-45-154", None, "bonjour"),
            Err(HubError::DuplicateId(id)) if id == "kitchen"
        ));
        assert!(matches!(
            registry.create("Garage", 51828, "031-45-154", None, "bonjour"),
            Err(HubError::PortInUse { port: 51828, .. })
        ));
        assert!(matches!(
            registry.create("!!!", 51830, "031-45-154", None, "bonjour"),
            Err(HubError::InvalidName(_))
        ));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn ids_and_ports_stay_unique() {
        let (_dir, mut registry) = registry();
        let attempts = [
            ("Kitchen", 51828),
            ("Garage", 51829),
            ("kitchen", 51830),
            ("Porch", 51829),
            ("Living Room", 51831),
            ("living-room", 51832),
        ];
        for (name, port) in attempts {
            let _ = registry.create(name, port, "031-45-154", None, "bonjour");
        }

        let list = registry.list();
        let ids: std::collections::HashSet<_> = list.iter().map(|r| &r.id).collect();
        let ports: std::collections::HashSet<_> = list.iter().map(|r| r.port).collect();
        assert_eq!(ids.len(), list.len());
        assert_eq!(ports.len(), list.len());
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn hub_is_always_first() {
        let (dir, mut registry) = registry();
        registry.create("Porch", 51830, "031-45-154", None, "bonjour").unwrap();
        registry.create("Garage", 51829, "031-45-154", None, "bonjour").unwrap();
        registry.ensure_hub(51826, "031-45-154").unwrap();
        assert_eq!(registry.list()[0].id, HUB_ID);
        assert_eq!(registry.list()[0].kind, BridgeKind::Hub);

        registry.create("Attic", 51831, "031-45-154", None, "bonjour").unwrap();
        assert_eq!(registry.list()[0].id, HUB_ID);

        registry.update("porch").unwrap().ports(52000, 52010).unwrap();
        assert_eq!(registry.list()[0].id, HUB_ID);

        registry.uninstall("garage").unwrap();
        assert_eq!(registry.list()[0].id, HUB_ID);

        // hub written last on disk is re-pinned on load
        let mut on_disk = registry.list();
        on_disk.rotate_left(1);
        fs::write(
            Paths::new(dir.path()).registry_file(),
            serde_json::to_string(&on_disk).unwrap(),
        )
        .unwrap();
        let reloaded = Registry::load(Paths::new(dir.path()), false);
        assert_eq!(reloaded.list()[0].id, HUB_ID);
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        fs::write(paths.registry_file(), "{ not json").unwrap();

        let mut registry = Registry::load(paths, false);
        assert!(registry.list().is_empty());

        registry.create("Kitchen", 51828, "031-45-154", None, "bonjour").unwrap();
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn dev_records_hidden_outside_dev_mode() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let json = serde_json::json!([
            {"id": "kitchen", "type": "bridge", "display": "Kitchen", "port": 51828,
             "pin": "031-45-154", "username": "AA:BB:CC:DD:EE:FF"},
            {"id": "sandbox", "type": "dev", "display": "Sandbox", "port": 51899,
             "pin": "031-45-154", "username": "AA:BB:CC:DD:EE:00"}
        ]);
        fs::write(paths.registry_file(), json.to_string()).unwrap();

        assert_eq!(Registry::load(paths.clone(), false).list().len(), 1);
        assert_eq!(Registry::load(paths, true).list().len(), 2);
    }

    #[test]
    fn update_info_and_ports() {
        let (_dir, mut registry) = registry();
        registry.create("Kitchen", 51828, "031-45-154", None, "bonjour").unwrap();
        registry.create("Garage", 51829, "031-45-154", None, "bonjour").unwrap();

        let updated = registry
            .update("kitchen")
            .unwrap()
            .info(Some("Kitchen Bridge"), None, Some(5), Some("ciao"))
            .unwrap();
        assert_eq!(updated.id, "kitchen");
        assert_eq!(updated.display, "Kitchen Bridge");
        assert_eq!(updated.autostart, 5);
        assert_eq!(updated.advertiser, "ciao");

        assert!(matches!(
            registry.update("kitchen").unwrap().ports(51820, 51830),
            Err(HubError::PortInUse { .. })
        ));
        assert!(matches!(
            registry.update("kitchen").unwrap().ports(52010, 52000),
            Err(HubError::InvalidRange { .. })
        ));
        let updated = registry.update("kitchen").unwrap().ports(52000, 52010).unwrap();
        assert_eq!(updated.ports, Some(PortRange { start: 52000, end: 52010 }));

        assert!(matches!(registry.update("ghost"), Err(HubError::NotFound(_))));
    }

    #[test]
    fn uninstall_removes_artifacts() {
        let (dir, mut registry) = registry();
        let paths = Paths::new(dir.path());
        registry.create("Kitchen", 51828, "031-45-154", None, "bonjour").unwrap();

        let [state, accessories, pairing, config] = paths.bridge_artifacts("kitchen");
        fs::create_dir_all(state.join("nested")).unwrap();
        fs::create_dir_all(&accessories).unwrap();
        fs::create_dir_all(&pairing).unwrap();
        fs::create_dir_all(config.parent().unwrap()).unwrap();
        fs::write(&config, "{}").unwrap();

        assert!(registry.uninstall("kitchen").unwrap());
        for artifact in paths.bridge_artifacts("kitchen") {
            assert!(!artifact.exists(), "{} still exists", artifact.display());
        }
    }

    #[test]
    fn hub_cannot_be_uninstalled() {
        let (_dir, mut registry) = registry();
        registry.ensure_hub(51826, "031-45-154").unwrap();
        assert!(registry.uninstall(HUB_ID).is_err());
        assert_eq!(registry.list().len(), 1);
    }
}
