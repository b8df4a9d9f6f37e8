//! Searchable, growable collection of templates keyed by string id.
//!
//! A [`DynamicTemplateIndex`] is a handle: clones share one index, which is
//! how a context tree can hold an index without copying it. Every operation
//! takes the internal lock once, so readers never observe a half-applied
//! single add or remove. Multi-entry operations are not atomic as a whole.
//!
//! Saved file layout (integers little-endian):
//!
//! ```text
//! "FRTI" | format u8 | name_len u8 | name | version u32 | capacity u32 |
//! max_license_count u32 (0 = unset) | count u32 |
//! count x (id_len u16 | id | template) | sha256(all preceding bytes)
//! ```

use crate::error::{Error, Result};
use crate::template::{truncation_is_corruption, ContextTemplate, Method};
use crate::types::{SearchResult, Similarity};
use crate::value::Value;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

const MAGIC: &[u8; 4] = b"FRTI";
const FORMAT_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 32;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Construction parameters for an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub method: Method,
    /// Effective capacity: `min(capacity, max_license_count)` when both are set.
    pub capacity: usize,
    pub max_license_count: Option<usize>,
}

impl IndexConfig {
    pub fn new(method: Method, capacity: usize) -> Self {
        Self {
            method,
            capacity,
            max_license_count: None,
        }
    }

    /// Parse `{modification, version, capacity?, max_license_count?}`.
    pub fn from_value(config: &Value) -> Result<Self> {
        let modification = config
            .get_by_key("modification")
            .and_then(|v| v.get_string())
            .map_err(|_| Error::Config("index config requires string \"modification\"".into()))?;
        let version = config
            .get_by_key("version")
            .ok()
            .and_then(Value::as_i64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::Config("index config requires non-negative integer \"version\"".into()))?;

        let capacity = optional_count(config, "capacity")?;
        let max_license_count = optional_count(config, "max_license_count")?;
        let effective = match (capacity, max_license_count) {
            (Some(c), Some(m)) => c.min(m),
            (Some(c), None) => c,
            (None, Some(m)) => m,
            (None, None) => DEFAULT_CAPACITY,
        };
        if effective == 0 {
            return Err(Error::Config("index capacity must be positive".into()));
        }

        Ok(Self {
            method: Method::new(modification, version),
            capacity: effective,
            max_license_count,
        })
    }
}

fn optional_count(config: &Value, key: &str) -> Result<Option<usize>> {
    match config.get_by_key(key) {
        Err(_) => Ok(None),
        Ok(Value::Null) => Ok(None),
        Ok(v) => v
            .as_i64()
            .filter(|n| *n > 0)
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| Error::Config(format!("index config \"{key}\" must be a positive integer"))),
    }
}

#[derive(Debug)]
struct IndexState {
    config: IndexConfig,
    entries: Vec<(String, ContextTemplate)>,
    positions: HashMap<String, usize>,
}

impl IndexState {
    fn new(config: IndexConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Entries share one payload size; the first entry fixes it.
    fn ensure_compatible(&self, template: &ContextTemplate) -> Result<()> {
        match self.entries.first() {
            Some((_, first)) => first.ensure_comparable(template),
            None => self.config.method.ensure_same(template.method()),
        }
    }

    fn add(&mut self, template: &ContextTemplate, id: &str) -> Result<()> {
        self.ensure_compatible(template)?;
        if self.positions.contains_key(id) {
            return Err(Error::DuplicateId(id.to_string()));
        }
        if self.entries.len() >= self.config.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.config.capacity,
            });
        }
        self.positions.insert(id.to_string(), self.entries.len());
        self.entries.push((id.to_string(), template.clone()));
        Ok(())
    }

    /// Remove `id`, moving the last entry into the freed slot.
    fn remove(&mut self, id: &str) -> Result<()> {
        let pos = self
            .positions
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("template id {id:?}")))?;
        self.entries.swap_remove(pos);
        if let Some((moved_id, _)) = self.entries.get(pos) {
            self.positions.insert(moved_id.clone(), pos);
        }
        Ok(())
    }

    fn entry(&self, index: usize) -> Result<&(String, ContextTemplate)> {
        self.entries.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.entries.len(),
        })
    }

    fn search_one(&self, query: &ContextTemplate, knn: usize) -> Result<Vec<SearchResult>> {
        self.ensure_compatible(query)?;
        let mut scored: Vec<(usize, Similarity)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (_, t))| (i, Similarity::between(query.embedding(), t.embedding())))
            .collect();
        // Stable sort keeps ascending position among equal similarities.
        scored.sort_by(|a, b| b.1.similarity.total_cmp(&a.1.similarity));
        Ok(scored
            .into_iter()
            .take(knn)
            .map(|(i, s)| SearchResult {
                uuid: self.entries[i].0.clone(),
                index: i,
                score: s.score,
                distance: s.distance,
            })
            .collect())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let config = &self.config;
        let name = config.method.name.as_bytes();
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.write_u8(FORMAT_VERSION)?;
        buf.write_u8(u8::try_from(name.len()).map_err(|_| Error::Config("method name too long".into()))?)?;
        buf.extend_from_slice(name);
        buf.write_u32::<LittleEndian>(config.method.version)?;
        buf.write_u32::<LittleEndian>(to_u32(config.capacity, "capacity")?)?;
        buf.write_u32::<LittleEndian>(to_u32(config.max_license_count.unwrap_or(0), "max_license_count")?)?;
        buf.write_u32::<LittleEndian>(to_u32(self.entries.len(), "entry count")?)?;
        for (id, template) in &self.entries {
            let id_len = u16::try_from(id.len()).map_err(|_| Error::Config(format!("template id too long: {id:?}")))?;
            buf.write_u16::<LittleEndian>(id_len)?;
            buf.extend_from_slice(id.as_bytes());
            template.save(&mut buf)?;
        }
        let digest = Sha256::digest(&buf);
        buf.extend_from_slice(&digest);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MAGIC.len() + CHECKSUM_LEN {
            return Err(Error::CorruptData("index file too short".into()));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(Error::CorruptData("index checksum mismatch".into()));
        }

        let mut cursor = Cursor::new(body);
        let state = Self::decode_body(&mut cursor).map_err(truncation_is_corruption)?;
        if cursor.position() as usize != body.len() {
            return Err(Error::CorruptData("trailing bytes in index file".into()));
        }
        Ok(state)
    }

    fn decode_body(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::CorruptData("bad index magic".into()));
        }
        let format = cursor.read_u8()?;
        if format != FORMAT_VERSION {
            return Err(Error::CorruptData(format!("unsupported index format {format}")));
        }
        let mut name = vec![0u8; cursor.read_u8()? as usize];
        cursor.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|_| Error::CorruptData("method name is not UTF-8".into()))?;
        let version = cursor.read_u32::<LittleEndian>()?;
        let capacity = cursor.read_u32::<LittleEndian>()? as usize;
        let max_license_count = match cursor.read_u32::<LittleEndian>()? {
            0 => None,
            n => Some(n as usize),
        };
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        if capacity == 0 || count > capacity {
            return Err(Error::CorruptData(format!("{count} entries for capacity {capacity}")));
        }

        let mut state = Self::new(IndexConfig {
            method: Method::new(name, version),
            capacity,
            max_license_count,
        });
        for _ in 0..count {
            let mut id = vec![0u8; cursor.read_u16::<LittleEndian>()? as usize];
            cursor.read_exact(&mut id)?;
            let id = String::from_utf8(id).map_err(|_| Error::CorruptData("template id is not UTF-8".into()))?;
            let template = ContextTemplate::load(&mut *cursor)?;
            state
                .add(&template, &id)
                .map_err(|e| Error::CorruptData(format!("entry {id:?}: {e}")))?;
        }
        Ok(state)
    }
}

fn to_u32(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::Config(format!("{what} does not fit the index file format")))
}

/// Shared handle to a template index.
#[derive(Clone)]
pub struct DynamicTemplateIndex {
    inner: Arc<RwLock<Option<IndexState>>>,
}

impl fmt::Debug for DynamicTemplateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.read_guard();
        match guard.as_ref() {
            Some(state) => f
                .debug_struct("DynamicTemplateIndex")
                .field("method", &state.config.method)
                .field("size", &state.entries.len())
                .field("capacity", &state.config.capacity)
                .finish(),
            None => f.write_str("DynamicTemplateIndex(released)"),
        }
    }
}

/// Handles are equal when they refer to the same index.
impl PartialEq for DynamicTemplateIndex {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl DynamicTemplateIndex {
    pub fn create(config: IndexConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::Config("index capacity must be positive".into()));
        }
        tracing::debug!(method = %config.method, capacity = config.capacity, "template index created");
        Ok(Self::from_state(IndexState::new(config)))
    }

    /// Create an index pre-seeded with `templates` under `ids`.
    pub fn create_with_templates<S: AsRef<str>>(
        templates: &[ContextTemplate],
        ids: &[S],
        config: IndexConfig,
    ) -> Result<Self> {
        if templates.len() != ids.len() {
            return Err(Error::Config(format!(
                "{} templates but {} ids",
                templates.len(),
                ids.len()
            )));
        }
        let mut state = IndexState::new(config);
        for (template, id) in templates.iter().zip(ids) {
            state.add(template, id.as_ref())?;
        }
        Ok(Self::from_state(state))
    }

    fn from_state(state: IndexState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(state))),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, Option<IndexState>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Option<IndexState>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&IndexState) -> Result<T>) -> Result<T> {
        match self.read_guard().as_ref() {
            Some(state) => f(state),
            None => Err(Error::AlreadyReleased("template index")),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&mut IndexState) -> Result<T>) -> Result<T> {
        match self.write_guard().as_mut() {
            Some(state) => f(state),
            None => Err(Error::AlreadyReleased("template index")),
        }
    }

    pub fn size(&self) -> Result<usize> {
        self.read(|s| Ok(s.entries.len()))
    }

    pub fn capacity(&self) -> Result<usize> {
        self.read(|s| Ok(s.config.capacity))
    }

    pub fn method(&self) -> Result<Method> {
        self.read(|s| Ok(s.config.method.clone()))
    }

    pub fn method_name(&self) -> Result<String> {
        self.read(|s| Ok(s.config.method.name.clone()))
    }

    pub fn version(&self) -> Result<u32> {
        self.read(|s| Ok(s.config.method.version))
    }

    pub fn add(&self, template: &ContextTemplate, id: &str) -> Result<()> {
        self.write(|s| s.add(template, id))
    }

    /// Add pairs in order, stopping at the first failure. Entries added
    /// before the failure stay in the index.
    pub fn add_many<S: AsRef<str>>(&self, templates: &[ContextTemplate], ids: &[S]) -> Result<()> {
        if templates.len() != ids.len() {
            return Err(Error::Config(format!(
                "{} templates but {} ids",
                templates.len(),
                ids.len()
            )));
        }
        self.write(|s| {
            templates
                .iter()
                .zip(ids)
                .try_for_each(|(t, id)| s.add(t, id.as_ref()))
        })
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.write(|s| s.remove(id))
    }

    /// Remove ids in order, stopping at the first missing one.
    pub fn remove_many<S: AsRef<str>>(&self, ids: &[S]) -> Result<()> {
        self.write(|s| ids.iter().try_for_each(|id| s.remove(id.as_ref())))
    }

    /// Append every entry of `other`. All checks run before anything is copied.
    pub fn concatenate(&self, other: &DynamicTemplateIndex) -> Result<()> {
        // Snapshot first so concatenating an index with itself cannot deadlock.
        let (method, incoming) = other.read(|s| Ok((s.config.method.clone(), s.entries.clone())))?;
        self.write(|s| {
            s.config.method.ensure_same(&method)?;
            if let Some((_, first)) = incoming.first() {
                s.ensure_compatible(first)?;
            }
            if s.entries.len() + incoming.len() > s.config.capacity {
                return Err(Error::CapacityExceeded {
                    capacity: s.config.capacity,
                });
            }
            if let Some((id, _)) = incoming.iter().find(|(id, _)| s.positions.contains_key(id)) {
                return Err(Error::DuplicateId(id.clone()));
            }
            for (id, template) in &incoming {
                s.add(template, id)?;
            }
            Ok(())
        })
    }

    pub fn get_by_uuid(&self, id: &str) -> Result<ContextTemplate> {
        self.read(|s| {
            s.positions
                .get(id)
                .map(|&pos| s.entries[pos].1.clone())
                .ok_or_else(|| Error::NotFound(format!("template id {id:?}")))
        })
    }

    pub fn get(&self, index: usize) -> Result<ContextTemplate> {
        self.read(|s| s.entry(index).map(|(_, t)| t.clone()))
    }

    pub fn uuid_at(&self, index: usize) -> Result<String> {
        self.read(|s| s.entry(index).map(|(id, _)| id.clone()))
    }

    /// Drop every entry; capacity and method stay.
    pub fn clear(&self) -> Result<()> {
        self.write(|s| {
            s.entries.clear();
            s.positions.clear();
            Ok(())
        })
    }

    /// Rank entries against each query, best first, at most `knn` per query.
    pub fn search(&self, queries: &[ContextTemplate], knn: usize) -> Result<Vec<Vec<SearchResult>>> {
        if knn == 0 {
            return Err(Error::Config("knn must be positive".into()));
        }
        self.read(|s| queries.iter().map(|q| s.search_one(q, knn)).collect())
    }

    pub fn save(&self, path: &Path, allow_overwrite: bool) -> Result<()> {
        let bytes = self.read(IndexState::encode)?;
        let mut options = std::fs::OpenOptions::new();
        options.write(true);
        if allow_overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = options.open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.to_path_buf()),
            _ => Error::Io(e),
        })?;
        std::io::Write::write_all(&mut file, &bytes)?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "template index saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let state = IndexState::decode(&bytes)?;
        tracing::info!(
            path = %path.display(),
            size = state.entries.len(),
            capacity = state.config.capacity,
            "template index loaded"
        );
        Ok(Self::from_state(state))
    }

    /// Release the index for every handle. A second call fails.
    pub fn release(&self) -> Result<()> {
        match self.write_guard().take() {
            Some(_) => Ok(()),
            None => Err(Error::AlreadyReleased("template index")),
        }
    }

    pub fn is_released(&self) -> bool {
        self.read_guard().is_none()
    }

    /// Placeholder body used when a tree holding this index is rendered as JSON.
    pub fn summary_json(&self) -> serde_json::Value {
        match self.read_guard().as_ref() {
            Some(s) => json!({
                "method": s.config.method.name,
                "version": s.config.method.version,
                "size": s.entries.len(),
                "capacity": s.config.capacity,
            }),
            None => serde_json::Value::Null,
        }
    }
}
