use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DeviceProfile, builtin, normalize};
use crate::error::CollectorError;

/// The narrow capability the execution core depends on.
pub trait ProfileLookup: Send + Sync {
    fn get_profile(&self, device_type: &str) -> Option<Arc<DeviceProfile>>;
}

/// One entry produced by a source. Failed entries are skipped by the registry.
pub struct ProfileEntry {
    /// Where the entry came from (file path, builtin key).
    pub origin: String,
    pub profile: Result<DeviceProfile, CollectorError>,
}

/// Where profiles are discovered. Sources only yield data.
pub trait ProfileSource: Send + Sync {
    fn describe(&self) -> String;

    /// Reads all entries. An `Err` means the source as a whole was unreadable.
    fn entries(&self) -> Result<Vec<ProfileEntry>, CollectorError>;
}

/// A fixed list of profiles, typically [`builtin::all`].
pub struct StaticSource {
    profiles: Vec<DeviceProfile>,
}

impl StaticSource {
    pub fn new(profiles: Vec<DeviceProfile>) -> Self {
        Self { profiles }
    }

    pub fn builtin() -> Self {
        Self::new(builtin::all())
    }
}

impl ProfileSource for StaticSource {
    fn describe(&self) -> String {
        format!("static({} profiles)", self.profiles.len())
    }

    fn entries(&self) -> Result<Vec<ProfileEntry>, CollectorError> {
        Ok(self
            .profiles
            .iter()
            .map(|p| ProfileEntry {
                origin: format!("static:{}", p.device_type),
                profile: Ok(p.clone()),
            })
            .collect())
    }
}

/// A directory of `*.json` profile files, one profile per file.
///
/// A file without a `device_type` is keyed by its file stem.
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_file(path: &Path) -> Result<DeviceProfile, CollectorError> {
        let raw = std::fs::read_to_string(path)?;
        let mut profile: DeviceProfile = serde_json::from_str(&raw)?;
        if profile.device_type.trim().is_empty()
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        {
            profile.device_type = stem.to_string();
        }
        Ok(profile)
    }
}

impl ProfileSource for JsonDirSource {
    fn describe(&self) -> String {
        format!("dir({})", self.dir.display())
    }

    fn entries(&self) -> Result<Vec<ProfileEntry>, CollectorError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('_') || n.starts_with('.'));
            if path.is_file() && is_json && !hidden {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths
            .into_iter()
            .map(|path| ProfileEntry {
                origin: path.display().to_string(),
                profile: Self::read_file(&path),
            })
            .collect())
    }
}

/// Several sources applied in order; later entries replace earlier ones.
pub struct LayeredSource {
    layers: Vec<Arc<dyn ProfileSource>>,
}

impl LayeredSource {
    pub fn new(layers: Vec<Arc<dyn ProfileSource>>) -> Self {
        Self { layers }
    }

    /// Built-in profiles overlaid by a JSON profile directory.
    pub fn builtin_with_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(vec![
            Arc::new(StaticSource::builtin()),
            Arc::new(JsonDirSource::new(dir)),
        ])
    }
}

impl ProfileSource for LayeredSource {
    fn describe(&self) -> String {
        let names: Vec<String> = self.layers.iter().map(|l| l.describe()).collect();
        format!("layered[{}]", names.join(", "))
    }

    fn entries(&self) -> Result<Vec<ProfileEntry>, CollectorError> {
        let mut all = Vec::new();
        for layer in &self.layers {
            match layer.entries() {
                Ok(entries) => all.extend(entries),
                Err(e) => warn!("Profile layer {} unreadable, skipped: {}", layer.describe(), e),
            }
        }
        Ok(all)
    }
}

/// Listing row for [`ProfileRegistry::describe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProfileSummary {
    pub device_type: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub vendor: String,
    pub command_overrides: usize,
}

#[derive(Default)]
struct ProfileTable {
    profiles: BTreeMap<String, Arc<DeviceProfile>>,
    aliases: HashMap<String, String>,
}

impl ProfileTable {
    fn build(entries: Vec<ProfileEntry>) -> Self {
        let mut table = ProfileTable::default();
        for entry in entries {
            let profile = match entry.profile.and_then(|p| p.validate().map(|_| p)) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping device profile from {}: {}", entry.origin, e);
                    continue;
                }
            };
            let types = profile.all_types();
            let key = types[0].clone();
            if table.profiles.contains_key(&key) {
                debug!("Device profile {} replaced by {}", key, entry.origin);
            }
            table.aliases.retain(|_, target| *target != key);
            for alias in types.iter().skip(1) {
                table.aliases.insert(alias.clone(), key.clone());
            }
            table.profiles.insert(key, Arc::new(profile));
        }
        table
    }

    fn get(&self, device_type: &str) -> Option<Arc<DeviceProfile>> {
        let key = normalize(device_type);
        self.profiles
            .get(&key)
            .or_else(|| self.aliases.get(&key).and_then(|k| self.profiles.get(k)))
            .cloned()
    }
}

/// Process-wide, read-mostly table of device profiles.
///
/// Lookups clone the current table `Arc` and never block on a reload; a
/// reload builds a complete new table and swaps the reference.
pub struct ProfileRegistry {
    table: RwLock<Arc<ProfileTable>>,
    source: RwLock<Option<Arc<dyn ProfileSource>>>,
}

impl ProfileRegistry {
    /// An empty registry. Every lookup falls back to generic defaults.
    pub fn empty() -> Self {
        Self {
            table: RwLock::new(Arc::new(ProfileTable::default())),
            source: RwLock::new(None),
        }
    }

    /// A registry populated with the compiled-in profiles.
    pub fn builtin() -> Self {
        let registry = Self::empty();
        registry.load(Arc::new(StaticSource::builtin()));
        registry
    }

    /// Populates the registry from `source` and remembers it for [`Self::reload`].
    ///
    /// Returns the number of profiles now loaded. Bad entries are logged and
    /// skipped; an unreadable source yields an empty table.
    pub fn load(&self, source: Arc<dyn ProfileSource>) -> usize {
        let count = self.swap_from(source.as_ref());
        *self.source.write() = Some(source);
        count
    }

    /// Re-reads the source last passed to [`Self::load`].
    pub fn reload(&self) -> usize {
        let source = self.source.read().clone();
        match source {
            Some(source) => self.swap_from(source.as_ref()),
            None => {
                debug!("Profile reload requested without a source; keeping current table");
                self.len()
            }
        }
    }

    fn swap_from(&self, source: &dyn ProfileSource) -> usize {
        let entries = match source.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Profile source {} unreadable: {}", source.describe(), e);
                Vec::new()
            }
        };
        let table = Arc::new(ProfileTable::build(entries));
        let count = table.profiles.len();
        *self.table.write() = table;
        info!("Loaded {} device profiles from {}", count, source.describe());
        count
    }

    fn snapshot(&self) -> Arc<ProfileTable> {
        self.table.read().clone()
    }

    pub fn get_profile(&self, device_type: &str) -> Option<Arc<DeviceProfile>> {
        self.snapshot().get(device_type)
    }

    pub fn has_profile(&self, device_type: &str) -> bool {
        self.get_profile(device_type).is_some()
    }

    /// Primary device type tags, sorted.
    pub fn list_types(&self) -> BTreeSet<String> {
        self.snapshot().profiles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn describe(&self) -> Vec<ProfileSummary> {
        self.snapshot()
            .profiles
            .values()
            .map(|p| ProfileSummary {
                device_type: p.device_type.clone(),
                name: p.name.clone(),
                aliases: p.all_types().into_iter().skip(1).collect(),
                vendor: p.device_info.vendor.clone(),
                command_overrides: p.commands.len(),
            })
            .collect()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileLookup for ProfileRegistry {
    fn get_profile(&self, device_type: &str) -> Option<Arc<DeviceProfile>> {
        ProfileRegistry::get_profile(self, device_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, body: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn builtin_registry_resolves_primary_and_alias_tags() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.get_profile("huawei").unwrap().device_type, "huawei");
        assert_eq!(registry.get_profile("HUAWEI_VRPV8").unwrap().device_type, "huawei");
        assert_eq!(registry.get_profile("h3c").unwrap().device_type, "hp_comware");
        assert!(registry.get_profile("juniper").is_none());
        assert!(registry.list_types().contains("cisco_ios"));
    }

    #[test]
    fn malformed_files_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "ruijie.json", r#"{"prompt_patterns": [".*#"]}"#);
        write_file(dir.path(), "broken.json", "{ not json");
        write_file(dir.path(), "badregex.json", r#"{"prompt_patterns": ["(["]}"#);
        write_file(dir.path(), "notes.txt", "ignored");

        let registry = ProfileRegistry::empty();
        let count = registry.load(Arc::new(JsonDirSource::new(dir.path())));

        assert_eq!(count, 1);
        assert!(registry.has_profile("ruijie"));
        assert!(!registry.has_profile("broken"));
    }

    #[test]
    fn missing_directory_yields_empty_table() {
        let registry = ProfileRegistry::builtin();
        let count = registry.load(Arc::new(JsonDirSource::new("/definitely/not/here")));
        assert_eq!(count, 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn layered_source_lets_files_override_builtins() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "huawei.json",
            r#"{"device_type": "huawei", "command_params": {"delay_factor": 9.0}}"#,
        );
        let registry = ProfileRegistry::empty();
        registry.load(Arc::new(LayeredSource::builtin_with_dir(dir.path())));

        let huawei = registry.get_profile("huawei").unwrap();
        assert_eq!(huawei.command_params.delay_factor, Some(9.0));
        assert!(registry.get_profile("huawei_vrp").is_none());
        assert!(registry.has_profile("cisco_ios"));
    }

    #[test]
    fn reload_swaps_whole_table_and_old_handles_stay_valid() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "alpha.json", r#"{"name": "Alpha v1"}"#);
        let registry = ProfileRegistry::empty();
        registry.load(Arc::new(JsonDirSource::new(dir.path())));
        let before = registry.get_profile("alpha").unwrap();

        write_file(dir.path(), "alpha.json", r#"{"name": "Alpha v2"}"#);
        write_file(dir.path(), "beta.json", r#"{}"#);
        assert_eq!(registry.reload(), 2);

        assert_eq!(before.name, "Alpha v1");
        assert_eq!(registry.get_profile("alpha").unwrap().name, "Alpha v2");
        assert!(registry.has_profile("beta"));
    }
}
