//! Persisted key-value preference store
//!
//! The controller remembers the last used device and the motion multipliers
//! between runs. Persistence goes through the [`PrefStore`] contract so the
//! host application can supply its own backend; [`TomlPrefStore`] is the
//! file-backed default and [`MemoryPrefStore`] backs tests.

use crate::error::Result;
use log::warn;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Key-value preference store contract
///
/// Absence of a key always yields the supplied default. Mutations take
/// effect immediately in memory; `save()` flushes them to the backing
/// storage.
pub trait PrefStore: Send {
    fn get_string(&self, key: &str, default: &str) -> String;
    fn get_float(&self, key: &str, default: f32) -> f32;
    fn get_int(&self, key: &str, default: i32) -> i32;

    fn set_string(&mut self, key: &str, value: &str);
    fn set_float(&mut self, key: &str, value: f32);
    fn set_int(&mut self, key: &str, value: i32);

    fn delete_key(&mut self, key: &str);

    /// Flush pending mutations to the backing storage
    fn save(&mut self) -> Result<()>;
}

/// In-memory preference store (no persistence)
#[derive(Debug, Default)]
pub struct MemoryPrefStore {
    values: BTreeMap<String, toml::Value>,
}

impl MemoryPrefStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn get_string_from(values: &BTreeMap<String, toml::Value>, key: &str, default: &str) -> String {
    match values.get(key) {
        Some(toml::Value::String(s)) => s.clone(),
        _ => default.to_string(),
    }
}

fn get_float_from(values: &BTreeMap<String, toml::Value>, key: &str, default: f32) -> f32 {
    match values.get(key) {
        Some(toml::Value::Float(f)) => *f as f32,
        Some(toml::Value::Integer(i)) => *i as f32,
        _ => default,
    }
}

fn get_int_from(values: &BTreeMap<String, toml::Value>, key: &str, default: i32) -> i32 {
    match values.get(key) {
        Some(toml::Value::Integer(i)) => *i as i32,
        _ => default,
    }
}

impl PrefStore for MemoryPrefStore {
    fn get_string(&self, key: &str, default: &str) -> String {
        get_string_from(&self.values, key, default)
    }

    fn get_float(&self, key: &str, default: f32) -> f32 {
        get_float_from(&self.values, key, default)
    }

    fn get_int(&self, key: &str, default: i32) -> i32 {
        get_int_from(&self.values, key, default)
    }

    fn set_string(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.to_string(), toml::Value::String(value.to_string()));
    }

    fn set_float(&mut self, key: &str, value: f32) {
        self.values
            .insert(key.to_string(), toml::Value::Float(value as f64));
    }

    fn set_int(&mut self, key: &str, value: i32) {
        self.values
            .insert(key.to_string(), toml::Value::Integer(value as i64));
    }

    fn delete_key(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn save(&mut self) -> Result<()> {
        Ok(())
    }
}

/// TOML-file-backed preference store
///
/// The file is a flat table of scalar values. A missing or unreadable file
/// starts the store empty rather than failing; preferences are best-effort.
#[derive(Debug)]
pub struct TomlPrefStore {
    path: PathBuf,
    values: BTreeMap<String, toml::Value>,
}

impl TomlPrefStore {
    /// Open the store at `path`, loading existing values if the file exists
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<toml::Table>(&contents) {
                Ok(table) => table.into_iter().collect(),
                Err(e) => {
                    warn!("Ignoring malformed preference file {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, values }
    }
}

impl PrefStore for TomlPrefStore {
    fn get_string(&self, key: &str, default: &str) -> String {
        get_string_from(&self.values, key, default)
    }

    fn get_float(&self, key: &str, default: f32) -> f32 {
        get_float_from(&self.values, key, default)
    }

    fn get_int(&self, key: &str, default: i32) -> i32 {
        get_int_from(&self.values, key, default)
    }

    fn set_string(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.to_string(), toml::Value::String(value.to_string()));
    }

    fn set_float(&mut self, key: &str, value: f32) {
        self.values
            .insert(key.to_string(), toml::Value::Float(value as f64));
    }

    fn set_int(&mut self, key: &str, value: i32) {
        self.values
            .insert(key.to_string(), toml::Value::Integer(value as i64));
    }

    fn delete_key(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn save(&mut self) -> Result<()> {
        let table: toml::Table = self.values.clone().into_iter().collect();
        let contents = toml::to_string_pretty(&table)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}
