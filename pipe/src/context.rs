use crate::error::{PipeError, Result};
use log::warn;
use std::any::{type_name, Any, TypeId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const WORKING_DIR: &str = "workingDir";
const DEF_WORKING_DIR: &str = ".";

#[derive(Clone)]
struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Entry {
    fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }
}

/// Key/value space shared by every stage and attached process of one pipe.
///
/// Cloning is cheap and yields a handle to the same map.
#[derive(Clone, Default)]
pub struct ProcessingContext {
    params: Arc<Mutex<BTreeMap<String, Entry>>>,
}

/// A context value a stage needs before it can start, declared as data
#[derive(Debug, Clone)]
pub struct ContextDep {
    key: String,
    type_id: TypeId,
    type_name: &'static str,
}

impl ContextDep {
    pub fn of<T: Any + Send + Sync>(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.params.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores a value, warning when an existing one is overwritten.
    /// Returns whether a previous value existed.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> bool {
        let key = key.into();
        let prev = self.lock().insert(key.clone(), Entry::new(value));
        if prev.is_some() {
            warn!("Context parameter '{}' already existed", key);
        }
        prev.is_some()
    }

    /// Stores a value unconditionally
    pub fn set_silently<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.lock().insert(key.into(), Entry::new(value));
    }

    /// Publishes a value during initialization; refuses to replace an
    /// existing key
    pub fn publish<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Result<()> {
        let key = key.into();
        let mut params = self.lock();
        if params.contains_key(&key) {
            return Err(PipeError::ContextCollision { key });
        }
        params.insert(key, Entry::new(value));
        Ok(())
    }

    /// Typed lookup; `None` when the key is absent or holds another type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.lock().get(key).cloned()?;
        entry.value.downcast::<T>().ok()
    }

    /// Typed lookup reporting why a value is unavailable
    pub fn require<T: Any + Send + Sync>(&self, stage: &str, key: &str) -> Result<Arc<T>> {
        self.check(stage, &ContextDep::of::<T>(key))?;
        self.get::<T>(key).ok_or_else(|| PipeError::MissingContext {
            stage: stage.to_string(),
            key: key.to_string(),
        })
    }

    /// Verifies that a declared dependency is present with the declared type
    pub fn check(&self, stage: &str, dep: &ContextDep) -> Result<()> {
        match self.lock().get(&dep.key) {
            None => Err(PipeError::MissingContext {
                stage: stage.to_string(),
                key: dep.key.clone(),
            }),
            Some(entry) if entry.type_id != dep.type_id => Err(PipeError::ContextType {
                key: dep.key.clone(),
                required: dep.type_name,
                supplied: entry.type_name,
            }),
            Some(_) => Ok(()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// All keys, in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Renders a value for reports. Numbers, strings and booleans are shown
    /// as-is, anything else by its type name.
    pub fn display_value(&self, key: &str) -> Option<String> {
        let entry = self.lock().get(key).cloned()?;
        let value = entry.value.as_ref();
        let shown = if let Some(v) = value.downcast_ref::<f64>() {
            v.to_string()
        } else if let Some(v) = value.downcast_ref::<u64>() {
            v.to_string()
        } else if let Some(v) = value.downcast_ref::<i64>() {
            v.to_string()
        } else if let Some(v) = value.downcast_ref::<usize>() {
            v.to_string()
        } else if let Some(v) = value.downcast_ref::<bool>() {
            v.to_string()
        } else if let Some(v) = value.downcast_ref::<String>() {
            v.clone()
        } else if let Some(v) = value.downcast_ref::<PathBuf>() {
            v.display().to_string()
        } else {
            format!("<{}>", entry.type_name)
        };
        Some(shown)
    }

    pub fn set_working_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let dir = if path.as_os_str().is_empty() {
            PathBuf::from(DEF_WORKING_DIR)
        } else {
            path.to_path_buf()
        };
        self.set(WORKING_DIR, dir);
    }

    pub fn working_dir(&self) -> PathBuf {
        self.get::<PathBuf>(WORKING_DIR)
            .map(|dir| dir.as_ref().clone())
            .unwrap_or_else(|| PathBuf::from(DEF_WORKING_DIR))
    }

    /// Resolves a file name against the working directory; absolute paths
    /// are returned unchanged
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir().join(path)
        }
    }
}
