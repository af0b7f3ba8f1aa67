//! Persistent context indices and their consistency.
//!
//! Three views over the same facts, held in memory behind a read-write lock
//! and persisted as JSON with write-then-rename:
//! - primary: model_id -> context index entries
//! - secondary: context_id -> model_id
//! - hash index: (model_id, content_hash) -> context_id
//!
//! The indices are rebuilt from the tier directories on startup when absent
//! or stale, and validated entry-by-entry on demand. Frames that fail header
//! verification are quarantined by renaming to `.broken`.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alloc::Tier;
use crate::config::HomeLayout;
use crate::context::ContextMeta;
use crate::error::{SnapError, SnapResult};
use crate::fsutil;
use crate::kv::{FrameHeader, FRAME_HEADER_SIZE};

/// One primary-index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextIndexEntry {
    pub context_id: String,
    pub name: String,
    pub file_path: PathBuf,
    pub token_count: u32,
    pub storage_size: u64,
    pub created_at: u64,
    pub last_accessed: u64,
    pub content_hash: String,
    pub file_size: u64,
    pub file_mtime: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedIndices {
    /// model_id -> entries.
    primary: HashMap<String, Vec<ContextIndexEntry>>,
    /// "model_id\0content_hash" -> context_id.
    hash_index: HashMap<String, String>,
}

#[derive(Default)]
struct RegistryState {
    primary: HashMap<String, Vec<ContextIndexEntry>>,
    secondary: HashMap<String, String>,
    hash_index: HashMap<(String, String), String>,
}

impl RegistryState {
    fn from_persisted(p: PersistedIndices) -> Self {
        let mut state = RegistryState {
            primary: p.primary,
            ..Default::default()
        };
        for (model_id, entries) in &state.primary {
            for entry in entries {
                state
                    .secondary
                    .insert(entry.context_id.clone(), model_id.clone());
            }
        }
        for (key, context_id) in p.hash_index {
            if let Some((model, hash)) = key.split_once('\0') {
                state
                    .hash_index
                    .insert((model.to_string(), hash.to_string()), context_id);
            }
        }
        state
    }

    fn to_persisted(&self) -> PersistedIndices {
        PersistedIndices {
            primary: self.primary.clone(),
            hash_index: self
                .hash_index
                .iter()
                .map(|((m, h), id)| (format!("{m}\0{h}"), id.clone()))
                .collect(),
        }
    }

    fn remove_entry(&mut self, context_id: &str) -> Option<ContextIndexEntry> {
        let model_id = self.secondary.remove(context_id)?;
        let mut removed = None;
        if let Some(entries) = self.primary.get_mut(&model_id) {
            if let Some(pos) = entries.iter().position(|e| e.context_id == context_id) {
                removed = Some(entries.remove(pos));
            }
            if entries.is_empty() {
                self.primary.remove(&model_id);
            }
        }
        self.hash_index.retain(|_, id| id != context_id);
        removed
    }
}

/// The registry.
pub struct Registry {
    layout: HomeLayout,
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new(layout: HomeLayout) -> Self {
        Self {
            layout,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Load the persisted indices, rebuilding from disk when the file is
    /// absent or frames on disk are newer than the recorded index.
    pub fn load_index(&self) -> SnapResult<usize> {
        let path = self.layout.context_registry_path();
        if !path.exists() {
            info!("No context registry on disk, rebuilding");
            return self.rebuild_index();
        }

        let index_mtime = mtime_of(&path).unwrap_or(0);
        if self.newest_frame_mtime() > index_mtime {
            info!("Context registry is stale, rebuilding");
            return self.rebuild_index();
        }

        let data = std::fs::read_to_string(&path)?;
        let persisted: PersistedIndices = match serde_json::from_str(&data) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Context registry unreadable, rebuilding");
                return self.rebuild_index();
            }
        };

        let state = RegistryState::from_persisted(persisted);
        let count = state.secondary.len();
        *self.state.write().unwrap() = state;
        info!(contexts = count, "Context registry loaded");
        Ok(count)
    }

    fn newest_frame_mtime(&self) -> u64 {
        let mut newest = 0;
        for tier in Tier::ALL {
            let dir = self.layout.tier_dir(tier);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "kvc") {
                    newest = newest.max(mtime_of(&path).unwrap_or(0));
                }
            }
        }
        newest
    }

    /// Scan the tier directories, verify each frame's header, reconstruct
    /// every entry, and persist the result. Broken frames are quarantined.
    pub fn rebuild_index(&self) -> SnapResult<usize> {
        let mut state = RegistryState::default();
        let mut quarantined = 0usize;

        for tier in Tier::ALL {
            let dir = self.layout.tier_dir(tier);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.extension().is_some_and(|e| e == "kvc") {
                    continue;
                }
                match self.reconstruct_entry(&path) {
                    Ok((model_id, index_entry)) => {
                        state
                            .secondary
                            .insert(index_entry.context_id.clone(), model_id.clone());
                        state.hash_index.insert(
                            (model_id.clone(), index_entry.content_hash.clone()),
                            index_entry.context_id.clone(),
                        );
                        state.primary.entry(model_id).or_default().push(index_entry);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Quarantining broken frame");
                        quarantine(&path);
                        quarantined += 1;
                    }
                }
            }
        }

        let count = state.secondary.len();
        let persisted = state.to_persisted();
        *self.state.write().unwrap() = state;
        fsutil::atomic_write_json(&self.layout.context_registry_path(), &persisted)?;

        info!(contexts = count, quarantined, "Context registry rebuilt");
        Ok(count)
    }

    /// Read a frame's header (cheap, 256 bytes) and its metadata record.
    fn reconstruct_entry(&self, path: &Path) -> SnapResult<(String, ContextIndexEntry)> {
        let mut file = std::fs::File::open(path)?;
        let meta = file.metadata()?;
        let file_size = meta.len();

        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        file.read_exact(&mut header_bytes)
            .map_err(|_| SnapError::CorruptArtifact(format!("{} truncated", path.display())))?;
        let header = FrameHeader::decode(&header_bytes)
            .map_err(|e| SnapError::CorruptArtifact(e.to_string()))?;

        if let Some(expected) = header.expected_file_size() {
            if file_size != expected {
                return Err(SnapError::CorruptArtifact(format!(
                    "{} is {file_size} bytes, header claims {expected}",
                    path.display()
                )));
            }
        }

        let meta_path = self.layout.context_metadata_path(&header.context_id);
        let meta_data = std::fs::read_to_string(&meta_path).map_err(|_| {
            SnapError::CorruptArtifact(format!(
                "metadata record missing for {}",
                header.context_id
            ))
        })?;
        let context_meta: ContextMeta = serde_json::from_str(&meta_data)?;

        let entry = ContextIndexEntry {
            context_id: header.context_id.clone(),
            name: if context_meta.name.is_empty() {
                context_meta.context_id.clone()
            } else {
                context_meta.name.clone()
            },
            file_path: path.to_path_buf(),
            token_count: header.sequence_length,
            storage_size: file_size,
            created_at: header.created_at,
            last_accessed: context_meta.last_accessed,
            content_hash: context_meta.content_hash.clone(),
            file_size,
            file_mtime: mtime_of(path).unwrap_or(0),
        };
        Ok((context_meta.model_id, entry))
    }

    /// Record a freshly ingested context in all three indices and persist.
    pub fn insert(&self, model_id: &str, entry: ContextIndexEntry) -> SnapResult<()> {
        let persisted = {
            let mut state = self.state.write().unwrap();
            state
                .secondary
                .insert(entry.context_id.clone(), model_id.to_string());
            state.hash_index.insert(
                (model_id.to_string(), entry.content_hash.clone()),
                entry.context_id.clone(),
            );
            let entries = state.primary.entry(model_id.to_string()).or_default();
            entries.retain(|e| e.context_id != entry.context_id);
            entries.push(entry);
            state.to_persisted()
        };
        fsutil::atomic_write_json(&self.layout.context_registry_path(), &persisted)?;
        Ok(())
    }

    /// Drop a context from all indices and persist. Unknown ids are a no-op.
    pub fn remove(&self, context_id: &str) -> SnapResult<Option<ContextIndexEntry>> {
        let (removed, persisted) = {
            let mut state = self.state.write().unwrap();
            let removed = state.remove_entry(context_id);
            (removed, state.to_persisted())
        };
        if removed.is_some() {
            fsutil::atomic_write_json(&self.layout.context_registry_path(), &persisted)?;
        }
        Ok(removed)
    }

    /// O(1) dedup lookup.
    pub fn lookup_hash(&self, model_id: &str, content_hash: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        state
            .hash_index
            .get(&(model_id.to_string(), content_hash.to_string()))
            .cloned()
    }

    /// Reverse lookup for deletion and validation.
    pub fn model_of(&self, context_id: &str) -> Option<String> {
        self.state.read().unwrap().secondary.get(context_id).cloned()
    }

    /// All entries for a model. With `force_scan`, the on-disk state is
    /// rescanned first.
    pub fn discover_contexts(
        &self,
        model_id: &str,
        force_scan: bool,
    ) -> SnapResult<Vec<ContextIndexEntry>> {
        if force_scan {
            self.rebuild_index()?;
        }
        let state = self.state.read().unwrap();
        Ok(state.primary.get(model_id).cloned().unwrap_or_default())
    }

    /// Every entry across all models.
    pub fn all_entries(&self) -> Vec<(String, ContextIndexEntry)> {
        let state = self.state.read().unwrap();
        state
            .primary
            .iter()
            .flat_map(|(model, entries)| {
                entries.iter().map(move |e| (model.clone(), e.clone()))
            })
            .collect()
    }

    /// Update the advisory access statistics for an entry.
    pub fn touch(&self, context_id: &str, last_accessed: u64) {
        let mut state = self.state.write().unwrap();
        if let Some(model_id) = state.secondary.get(context_id).cloned() {
            if let Some(entries) = state.primary.get_mut(&model_id) {
                if let Some(entry) = entries.iter_mut().find(|e| e.context_id == context_id) {
                    entry.last_accessed = last_accessed;
                }
            }
        }
    }

    /// The entry's recorded frame path changed (tier move).
    pub fn update_location(&self, context_id: &str, path: &Path) -> SnapResult<()> {
        let persisted = {
            let mut state = self.state.write().unwrap();
            let Some(model_id) = state.secondary.get(context_id).cloned() else {
                return Ok(());
            };
            if let Some(entries) = state.primary.get_mut(&model_id) {
                if let Some(entry) = entries.iter_mut().find(|e| e.context_id == context_id) {
                    entry.file_path = path.to_path_buf();
                    entry.file_mtime = mtime_of(path).unwrap_or(entry.file_mtime);
                }
            }
            state.to_persisted()
        };
        fsutil::atomic_write_json(&self.layout.context_registry_path(), &persisted)?;
        Ok(())
    }

    /// Walk every entry, drop the ones whose frame is missing or whose
    /// size/mtime disagree with the record. Returns the number removed.
    pub fn validate_index(&self) -> SnapResult<usize> {
        let entries = self.all_entries();
        let mut dropped = 0usize;

        for (_, entry) in entries {
            let ok = match std::fs::metadata(&entry.file_path) {
                Ok(meta) => {
                    meta.len() == entry.file_size
                        && mtime_of(&entry.file_path).unwrap_or(0) == entry.file_mtime
                }
                Err(_) => false,
            };
            if !ok {
                debug!(context_id = entry.context_id, "Dropping invalid index entry");
                self.remove(&entry.context_id)?;
                dropped += 1;
            }
        }

        if dropped > 0 {
            info!(dropped, "Index validation removed broken entries");
        }
        Ok(dropped)
    }

    /// Number of indexed contexts.
    pub fn len(&self) -> usize {
        self.state.read().unwrap().secondary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn mtime_of(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

/// Rename a broken frame aside so it is never retried automatically.
fn quarantine(path: &Path) {
    let mut target = path.as_os_str().to_owned();
    target.push(".broken");
    if let Err(e) = std::fs::rename(path, PathBuf::from(&target)) {
        warn!(path = %path.display(), error = %e, "Failed to quarantine frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextState;
    use crate::dequant::ModelShape;
    use crate::kv::{KvDtype, KvFrame};
    use tempfile::TempDir;

    fn shape() -> ModelShape {
        ModelShape {
            architecture: "llama".into(),
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 2,
            head_dim: 8,
            vocab_size: 64,
            context_length: 128,
        }
    }

    fn write_context(layout: &HomeLayout, id: &str, model: &str, hash: &str, tier: Tier) {
        let payload = vec![3u8; 512];
        let frame = KvFrame::encode(
            id, "fp-1", 1000, 2, 2, 8, 16, KvDtype::Fp16, &payload, None,
        )
        .unwrap();
        let frame_path = layout.frame_path(tier, id);
        std::fs::write(&frame_path, &frame).unwrap();

        let meta = ContextMeta {
            context_id: id.to_string(),
            name: id.to_string(),
            model_id: model.to_string(),
            model_fingerprint: "fp-1".into(),
            content_hash: hash.to_string(),
            shape: shape(),
            token_count: 16,
            created_at: 1000,
            last_accessed: 1000,
            access_count: 0,
            tier,
            storage_size: frame.len() as u64,
            compressed: false,
            ttl_secs: 0,
            state: ContextState::Ready,
        };
        fsutil::atomic_write_json(&layout.context_metadata_path(id), &meta).unwrap();
    }

    fn scratch() -> (TempDir, HomeLayout) {
        let tmp = TempDir::new().unwrap();
        let layout = HomeLayout::new(tmp.path());
        layout.ensure_dirs().unwrap();
        (tmp, layout)
    }

    #[test]
    fn test_rebuild_discovers_frames() {
        let (_tmp, layout) = scratch();
        write_context(&layout, "c1", "m1", "h1", Tier::Warm);
        write_context(&layout, "c2", "m1", "h2", Tier::Cold);
        write_context(&layout, "c3", "m2", "h3", Tier::Hot);

        let registry = Registry::new(layout);
        let count = registry.rebuild_index().unwrap();
        assert_eq!(count, 3);

        assert_eq!(registry.lookup_hash("m1", "h1"), Some("c1".to_string()));
        assert_eq!(registry.model_of("c3"), Some("m2".to_string()));
        assert_eq!(registry.discover_contexts("m1", false).unwrap().len(), 2);
    }

    #[test]
    fn test_partial_frame_quarantined() {
        let (_tmp, layout) = scratch();
        write_context(&layout, "good", "m1", "h1", Tier::Warm);

        // Simulate a crash mid-write: truncated garbage frame.
        let partial = layout.frame_path(Tier::Warm, "partial");
        std::fs::write(&partial, b"SKVC garbage").unwrap();

        let registry = Registry::new(layout.clone());
        let count = registry.rebuild_index().unwrap();
        assert_eq!(count, 1);
        assert!(!partial.exists());
        assert!(layout
            .tier_dir(Tier::Warm)
            .join("partial.kvc.broken")
            .exists());
    }

    #[test]
    fn test_indices_agree() {
        let (_tmp, layout) = scratch();
        write_context(&layout, "c1", "m1", "h1", Tier::Warm);
        write_context(&layout, "c2", "m1", "h2", Tier::Warm);

        let registry = Registry::new(layout);
        registry.rebuild_index().unwrap();

        // Every hash-index entry is present in the primary and vice versa.
        for (model, entry) in registry.all_entries() {
            assert_eq!(
                registry.lookup_hash(&model, &entry.content_hash),
                Some(entry.context_id.clone())
            );
            assert_eq!(registry.model_of(&entry.context_id), Some(model));
        }
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let (_tmp, layout) = scratch();
        let registry = Registry::new(layout);
        assert!(registry.remove("nope").unwrap().is_none());
    }

    #[test]
    fn test_validate_drops_missing_files() {
        let (_tmp, layout) = scratch();
        write_context(&layout, "c1", "m1", "h1", Tier::Warm);
        write_context(&layout, "c2", "m1", "h2", Tier::Warm);

        let registry = Registry::new(layout.clone());
        registry.rebuild_index().unwrap();

        std::fs::remove_file(layout.frame_path(Tier::Warm, "c1")).unwrap();
        let dropped = registry.validate_index().unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup_hash("m1", "h1").is_none());
    }

    #[test]
    fn test_load_reuses_persisted_index() {
        let (_tmp, layout) = scratch();
        write_context(&layout, "c1", "m1", "h1", Tier::Warm);

        let registry = Registry::new(layout.clone());
        registry.rebuild_index().unwrap();
        drop(registry);

        let fresh = Registry::new(layout);
        let count = fresh.load_index().unwrap();
        assert_eq!(count, 1);
        assert_eq!(fresh.lookup_hash("m1", "h1"), Some("c1".to_string()));
    }
}
