//! Vortex keeps its whole application state in a LevelDB database
//! (`state.v2`). Keys are state paths joined with `###`; values are JSON
//! leaves. This module hides the database behind a small key/value trait so
//! the adapter can be exercised against an in-memory store.

use crate::{
    error::{MigrationError, MigrationResult},
    instance::ManagerKind,
    process::ProcessChecker,
};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusty_leveldb::{LdbIterator, Options, StatusCode, WriteBatch, DB};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const KEY_SEPARATOR: &str = "###";
pub const STATE_DIR: &str = "state.v2";

pub trait StateStore {
    fn get(&mut self, key: &str) -> Result<Option<String>>;
    fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<(String, String)>>;
    fn write(&mut self, entries: &[(String, String)]) -> Result<()>;
}

pub trait StateBackend: Send + Sync {
    fn open(&self) -> MigrationResult<Box<dyn StateStore>>;
    fn location(&self) -> PathBuf;
    fn backup(&self) -> Result<Option<PathBuf>>;
}

pub fn join_key(parts: &[&str]) -> String {
    parts.join(KEY_SEPARATOR)
}

pub struct LevelDbBackend {
    path: PathBuf,
    check_process: bool,
}

impl LevelDbBackend {
    pub fn new(app_dir: &Path) -> Self {
        Self {
            path: app_dir.join(STATE_DIR),
            check_process: true,
        }
    }

    pub fn without_process_check(mut self) -> Self {
        self.check_process = false;
        self
    }
}

impl StateBackend for LevelDbBackend {
    fn open(&self) -> MigrationResult<Box<dyn StateStore>> {
        if !self.path.is_dir() {
            return Err(MigrationError::InstanceNotFound(format!(
                "Vortex state database {}",
                self.path.display()
            )));
        }
        if self.check_process && ProcessChecker::vortex_running() {
            return Err(MigrationError::DatabaseLocked {
                manager: ManagerKind::Vortex,
                path: self.path.clone(),
            });
        }
        let mut options = Options::default();
        options.create_if_missing = false;
        match DB::open(&self.path, options) {
            Ok(db) => Ok(Box::new(LevelDbStore { db })),
            Err(status) if status.code == StatusCode::LockError => {
                Err(MigrationError::DatabaseLocked {
                    manager: ManagerKind::Vortex,
                    path: self.path.clone(),
                })
            }
            Err(status) => Err(MigrationError::Other(anyhow!(
                "open {:?}: {:?} {}",
                self.path,
                status.code,
                status.err
            ))),
        }
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }

    fn backup(&self) -> Result<Option<PathBuf>> {
        if !self.path.is_dir() {
            return Ok(None);
        }
        let parent = self.path.parent().context("state dir has no parent")?;
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!("[year][month][day]-[hour][minute][second]"))
            .context("format backup stamp")?;
        let mut target = parent.join(format!("{STATE_DIR}.backup-{stamp}"));
        let mut counter = 1;
        while target.exists() {
            target = parent.join(format!("{STATE_DIR}.backup-{stamp}-{counter}"));
            counter += 1;
        }
        copy_dir(&self.path, &target)?;
        info!(backup = %target.display(), "backed up Vortex state");
        Ok(Some(target))
    }
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.context("walk state dir")?;
        let rel = entry.path().strip_prefix(source).context("rel path")?;
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).with_context(|| format!("create {:?}", dest))?;
        } else if entry.file_type().is_file() {
            // LOCK is held by the open database on some platforms.
            if rel == Path::new("LOCK") {
                continue;
            }
            fs::copy(entry.path(), &dest).with_context(|| format!("copy {:?}", entry.path()))?;
        }
    }
    Ok(())
}

struct LevelDbStore {
    db: DB,
}

impl StateStore for LevelDbStore {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .get(key.as_bytes())
            .map(|value| String::from_utf8_lossy(&value).to_string()))
    }

    fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut iter = self
            .db
            .new_iter()
            .map_err(|status| anyhow!("iterate state: {}", status.err))?;
        let prefix = prefix.as_bytes();
        let mut key = Vec::new();
        let mut value = Vec::new();
        let mut out = Vec::new();
        while iter.advance() {
            if !iter.current(&mut key, &mut value) {
                continue;
            }
            if key.starts_with(prefix) {
                out.push((
                    String::from_utf8_lossy(&key).to_string(),
                    String::from_utf8_lossy(&value).to_string(),
                ));
            }
        }
        debug!(count = out.len(), "scanned state prefix");
        Ok(out)
    }

    fn write(&mut self, entries: &[(String, String)]) -> Result<()> {
        let mut batch = WriteBatch::new();
        for (key, value) in entries {
            batch.put(key.as_bytes(), value.as_bytes());
        }
        self.db
            .write(batch, true)
            .map_err(|status| anyhow!("write state: {}", status.err))?;
        self.db
            .flush()
            .map_err(|status| anyhow!("flush state: {}", status.err))?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<BTreeMap<String, String>>>,
    backups: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
    locked: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.data.lock().insert(key.to_string(), value.to_string());
    }

    pub fn set_tree(&self, prefix: &str, value: &Value) {
        let mut data = self.data.lock();
        for (key, raw) in flatten(prefix, value) {
            data.insert(key, raw);
        }
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).map(|raw| parse_leaf(raw))
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.lock().clone()
    }

    pub fn backup_count(&self) -> usize {
        self.backups.lock().len()
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }
}

impl StateBackend for MemoryBackend {
    fn open(&self) -> MigrationResult<Box<dyn StateStore>> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(MigrationError::DatabaseLocked {
                manager: ManagerKind::Vortex,
                path: self.location(),
            });
        }
        Ok(Box::new(MemoryStore {
            data: Arc::clone(&self.data),
        }))
    }

    fn location(&self) -> PathBuf {
        PathBuf::from(":memory:")
    }

    fn backup(&self) -> Result<Option<PathBuf>> {
        let snapshot = self.snapshot();
        self.backups.lock().push(snapshot);
        Ok(None)
    }
}

struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, String>>>,
}

impl StateStore for MemoryStore {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .data
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write(&mut self, entries: &[(String, String)]) -> Result<()> {
        let mut data = self.data.lock();
        for (key, value) in entries {
            data.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

fn parse_leaf(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn load_tree(store: &mut dyn StateStore, prefix: &str) -> Result<Value> {
    let scan = format!("{prefix}{KEY_SEPARATOR}");
    let mut root = Map::new();
    for (key, raw) in store.scan_prefix(&scan)? {
        let rest = &key[scan.len()..];
        let parts: Vec<&str> = rest.split(KEY_SEPARATOR).collect();
        insert_path(&mut root, &parts, parse_leaf(&raw));
    }
    Ok(Value::Object(root))
}

fn insert_path(node: &mut Map<String, Value>, parts: &[&str], value: Value) {
    let Some((first, rest)) = parts.split_first() else {
        return;
    };
    if rest.is_empty() {
        // A leaf never replaces an object already built from deeper keys.
        if !matches!(node.get(*first), Some(Value::Object(_))) {
            node.insert(first.to_string(), value);
        }
        return;
    }
    let child = node
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(map) = child {
        insert_path(map, rest, value);
    }
}

/// Inverse of `load_tree`: one pair per JSON leaf. Empty objects and arrays
/// are stored as leaves.
pub fn flatten(prefix: &str, value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(prefix.to_string(), value, &mut out);
    out
}

fn flatten_into(key: String, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (name, child) in map {
                flatten_into(format!("{key}{KEY_SEPARATOR}{name}"), child, out);
            }
        }
        leaf => out.push((key, leaf.to_string())),
    }
}
