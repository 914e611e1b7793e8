//! Declarative device profile store.
//!
//! A [`Profile`] describes one emulated device's simulated data surface in
//! JSON, on disk under a profile directory, one file per profile named
//! `<name>.json`. [`ProfileStore::load`] parses every profile in the
//! directory once and hands out an immutable, cheaply-clonable handle;
//! there is no process-wide mutable singleton to synchronize around
//! (unlike the Python original's module-level cache) — a later
//! [`ProfileStore::reload`] simply builds and returns a new handle.

use plc_common::{HoneypotError, HoneypotResult};
use plc_waveform::WaveformSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A Modbus register entry: an address, its waveform, and its wire type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    /// Modbus address (0-65535).
    pub address: u16,
    /// Waveform driving this register's value. Ignored for `string`
    /// entries, which are populated from `text` instead.
    pub waveform: WaveformSpec,
    /// Wire encoding for this register's value.
    #[serde(default)]
    pub data_type: RegisterType,
    /// Fixed text to pack into a `string`-typed entry at initialization.
    /// No waveform family produces text, so string entries behave like
    /// `static`: written once, never touched by the simulator again.
    #[serde(default)]
    pub text: Option<String>,
}

/// Wire encoding for a Modbus register entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegisterTypeTag {
    /// One 16-bit register.
    #[default]
    Int16,
    /// Two consecutive registers, big-endian IEEE-754.
    Float32,
    /// `length` consecutive registers, ASCII packed two bytes per register.
    String,
}

/// Wire encoding plus any parameters it needs (string length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterType {
    /// Which encoding applies.
    #[serde(flatten)]
    pub kind: RegisterTypeTag,
    /// Register count for `string` entries; ignored otherwise.
    #[serde(default)]
    pub length: usize,
}

impl Default for RegisterType {
    fn default() -> Self {
        Self {
            kind: RegisterTypeTag::Int16,
            length: 0,
        }
    }
}

impl RegisterType {
    /// How many consecutive 16-bit registers this entry occupies.
    #[must_use]
    pub fn register_span(&self) -> u16 {
        match self.kind {
            RegisterTypeTag::Int16 => 1,
            RegisterTypeTag::Float32 => 2,
            RegisterTypeTag::String => self.length as u16,
        }
    }
}

/// A coil/discrete-input entry: an address and its waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoolEntry {
    /// Modbus address.
    pub address: u16,
    /// Waveform driving this bit's value.
    pub waveform: WaveformSpec,
}

/// The Modbus half of a profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusProfile {
    /// Holding register entries (read/write).
    pub holding_registers: Vec<RegisterEntry>,
    /// Input register entries (read-only).
    pub input_registers: Vec<RegisterEntry>,
    /// Coil entries (read/write).
    pub coils: Vec<BoolEntry>,
    /// Discrete input entries (read-only).
    pub discrete_inputs: Vec<BoolEntry>,
    /// Name of a registered device-specific post-processing hook to run
    /// after every tick (e.g. `"pm5300_command"`). `None` runs no hook.
    pub post_hook: Option<String>,
}

/// Wire encoding for one S7 cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum S7DataType {
    /// Signed 16-bit.
    Int,
    /// Unsigned 16-bit.
    Word,
    /// Signed 32-bit.
    Dint,
    /// Unsigned 32-bit.
    Dword,
    /// IEEE-754 32-bit float.
    Real,
    /// Single byte.
    Byte,
}

impl S7DataType {
    /// Byte width of this data type.
    #[must_use]
    pub fn byte_width(self) -> usize {
        match self {
            S7DataType::Byte => 1,
            S7DataType::Int | S7DataType::Word => 2,
            S7DataType::Dint | S7DataType::Dword | S7DataType::Real => 4,
        }
    }
}

/// One S7 memory cell's waveform and wire type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S7Entry {
    /// Waveform driving this cell's value.
    pub waveform: WaveformSpec,
    /// Wire encoding.
    pub data_type: S7DataType,
}

/// The S7 half of a profile. Keys are byte offsets within the area (or,
/// for `db`, within the named DB number).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S7Profile {
    /// Data blocks, keyed by DB number then byte offset.
    pub db: BTreeMap<u16, BTreeMap<u16, S7Entry>>,
    /// Merker (flag memory), keyed by byte offset.
    pub m: BTreeMap<u16, S7Entry>,
    /// Process image inputs, keyed by byte offset.
    pub i: BTreeMap<u16, S7Entry>,
    /// Process image outputs, keyed by byte offset.
    pub q: BTreeMap<u16, S7Entry>,
}

/// A named, declarative description of an emulated device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Human-readable name (also used as the metadata `name` field; the
    /// filename-derived logical name is tracked separately by the store).
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Author/maintainer of this profile.
    pub author: String,
    /// Profile schema/content version.
    pub version: String,
    /// Modbus simulation surface, if this profile covers Modbus.
    pub modbus: Option<ModbusProfile>,
    /// S7 simulation surface, if this profile covers S7comm.
    pub s7: Option<S7Profile>,
}

/// Summary metadata for [`ProfileStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    /// Logical profile name (filename without `.json`).
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Protocol this profile primarily targets, by heuristic (matches the
    /// original server's `/api/profiles` listing: a profile with a
    /// `modbus` section is reported as `"modbus"`, otherwise `"s7comm"`).
    pub protocol: String,
}

/// An immutable, loaded set of profiles.
///
/// Cloning is cheap (`Arc` internally); there is deliberately no interior
/// mutability — call [`ProfileStore::reload`] to get a fresh handle that
/// reflects the directory's current contents.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
    profiles: Arc<BTreeMap<String, Profile>>,
}

impl ProfileStore {
    /// Load every `*.json` file in `dir` as a profile, keyed by filename
    /// stem. Malformed files are skipped with a warning, matching the
    /// honeypot principle that one bad profile must not take the whole
    /// fleet down.
    pub fn load(dir: impl Into<PathBuf>) -> HoneypotResult<Self> {
        let dir = dir.into();
        let mut profiles = BTreeMap::new();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                tracing::warn!(?dir, "profile directory not found, starting empty");
                return Ok(Self {
                    dir,
                    profiles: Arc::new(profiles),
                });
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Self::load_one(&path) {
                Ok(profile) => {
                    profiles.insert(stem.to_string(), profile);
                }
                Err(err) => {
                    tracing::warn!(?path, %err, "skipping unparseable profile");
                }
            }
        }

        Ok(Self {
            dir,
            profiles: Arc::new(profiles),
        })
    }

    fn load_one(path: &Path) -> HoneypotResult<Profile> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| HoneypotError::Profile(e.to_string()))
    }

    /// Build a fresh handle from the same directory, picking up any files
    /// added, removed, or edited since this handle was created.
    pub fn reload(&self) -> HoneypotResult<Self> {
        Self::load(self.dir.clone())
    }

    /// List summary metadata for every loaded profile, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<ProfileInfo> {
        self.profiles
            .iter()
            .map(|(name, profile)| ProfileInfo {
                name: name.clone(),
                description: profile.description.clone(),
                protocol: if profile.modbus.is_some() {
                    "modbus".to_string()
                } else {
                    "s7comm".to_string()
                },
            })
            .collect()
    }

    /// Fetch full metadata for one profile by logical name.
    #[must_use]
    pub fn info(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Fetch the Modbus half of a named profile, if present.
    #[must_use]
    pub fn get_modbus(&self, name: &str) -> Option<&ModbusProfile> {
        self.profiles.get(name).and_then(|p| p.modbus.as_ref())
    }

    /// Fetch the S7 half of a named profile, if present.
    #[must_use]
    pub fn get_s7(&self, name: &str) -> Option<&S7Profile> {
        self.profiles.get(name).and_then(|p| p.s7.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_profile(dir: &Path, name: &str, json: &str) {
        let mut f = std::fs::File::create(dir.join(format!("{name}.json"))).unwrap();
        f.write_all(json.as_bytes()).unwrap();
    }

    #[test]
    fn unknown_name_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(tmp.path()).unwrap();
        assert!(store.info("nonexistent").is_none());
        assert!(store.get_modbus("nonexistent").is_none());
    }

    #[test]
    fn loads_and_lists_profiles() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(
            tmp.path(),
            "water_treatment",
            r#"{
                "name": "Water Treatment",
                "description": "A water treatment plant",
                "modbus": {
                    "holding_registers": [
                        {"address": 0, "waveform": {"type": "sine", "min": 20.0, "max": 80.0, "period_s": 300.0}}
                    ]
                }
            }"#,
        );

        let store = ProfileStore::load(tmp.path()).unwrap();
        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "water_treatment");
        assert_eq!(list[0].protocol, "modbus");

        let modbus = store.get_modbus("water_treatment").unwrap();
        assert_eq!(modbus.holding_registers.len(), 1);
        assert_eq!(modbus.holding_registers[0].address, 0);
    }

    #[test]
    fn reload_picks_up_new_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(tmp.path()).unwrap();
        assert_eq!(store.list().len(), 0);

        write_profile(tmp.path(), "new_profile", r#"{"name": "New"}"#);
        let reloaded = store.reload().unwrap();
        assert_eq!(reloaded.list().len(), 1);
        // The original handle is untouched.
        assert_eq!(store.list().len(), 0);
    }

    #[test]
    fn malformed_profile_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "broken", "{not valid json");
        write_profile(tmp.path(), "good", r#"{"name": "Good"}"#);

        let store = ProfileStore::load(tmp.path()).unwrap();
        assert_eq!(store.list().len(), 1);
        assert!(store.info("good").is_some());
    }
}
