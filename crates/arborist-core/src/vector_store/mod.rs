//! Tiered vector store.
//!
//! Three tiers (L1 hot LRU, L2 warm map, L3 cold one-file-per-fragment JSON) sit in
//! front of a per-class bulk `docs.json`/`vec.bin` layout that `search` reads
//! directly, scored by plain cosine similarity.

mod durable;
mod fragment;

pub use durable::{ClassIndex, ProjectMeta};
pub use fragment::{FragmentMeta, VectorFragment};

use anyhow::Result;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.3;

/// Byte-budgeted LRU: evicts the least-recently-used fragment whenever the running
/// total would exceed `budget_bytes`. `lru::LruCache` tracks recency; the byte count
/// is tracked alongside it since the crate has no built-in weighted eviction.
struct HotCache {
    entries: lru::LruCache<String, VectorFragment>,
    bytes: usize,
    budget_bytes: usize,
}

impl HotCache {
    fn new(budget_bytes: usize) -> Self {
        Self {
            entries: lru::LruCache::unbounded(),
            bytes: 0,
            budget_bytes,
        }
    }

    fn put(&mut self, fragment: VectorFragment) {
        let id = fragment.id().to_string();
        if let Some(old) = self.entries.pop(&id) {
            self.bytes = self.bytes.saturating_sub(old.approx_bytes());
        }
        self.bytes += fragment.approx_bytes();
        self.entries.put(id, fragment);

        while self.bytes > self.budget_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes = self.bytes.saturating_sub(evicted.approx_bytes()),
                None => break,
            }
        }
    }

    fn get(&mut self, id: &str) -> Option<VectorFragment> {
        self.entries.get(id).cloned()
    }

    fn remove_prefix(&mut self, prefix: &str) {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(id, _)| id.clone())
            .collect();
        for id in matching {
            if let Some(f) = self.entries.pop(&id) {
                self.bytes = self.bytes.saturating_sub(f.approx_bytes());
            }
        }
    }
}

/// A ranked search hit.
#[derive(Debug, Clone)]
pub struct ScoredFragment {
    pub fragment: VectorFragment,
    pub score: f32,
}

pub struct VectorStore {
    root: PathBuf,
    dim: usize,
    similarity_threshold: f32,
    l1: Mutex<HotCache>,
    l2: DashMap<String, VectorFragment>,
    classes: DashMap<String, Arc<RwLock<ClassIndex>>>,
}

impl VectorStore {
    pub fn new(root: PathBuf, dim: usize, hot_cache_bytes: usize) -> Self {
        Self {
            root,
            dim,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            l1: Mutex::new(HotCache::new(hot_cache_bytes)),
            l2: DashMap::new(),
            classes: DashMap::new(),
        }
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    fn l3_path(&self, id: &str) -> PathBuf {
        self.root.join("fragments").join(VectorFragment::l3_relative_path(id))
    }

    async fn class_index(&self, class: &str) -> Arc<RwLock<ClassIndex>> {
        if let Some(existing) = self.classes.get(class) {
            return existing.clone();
        }
        let loaded = durable::load_class(&self.root, class, self.dim).await;
        let handle = Arc::new(RwLock::new(loaded));
        self.classes.insert(class.to_string(), handle.clone());
        handle
    }

    /// Write L1 immediately; L3 (and the class's durable bulk index) are persisted
    /// in a spawned task so the caller never blocks on disk I/O.
    pub async fn add(&self, fragment: VectorFragment) -> Result<()> {
        let class = VectorFragment::class_of(fragment.id()).to_string();
        let class_handle = self.class_index(&class).await;

        {
            let mut l1 = self.l1.lock().await;
            l1.put(fragment.clone());
        }
        self.l2.remove(fragment.id());

        if let Some(vector) = fragment.vector.clone() {
            let mut index = class_handle.write().await;
            index.upsert(fragment.meta.clone(), vector);
        }

        let root = self.root.clone();
        let l3_path = self.l3_path(fragment.id());
        let class_name = class.clone();
        let class_handle = class_handle.clone();
        tokio::spawn(async move {
            if let Some(parent) = l3_path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    warn!(error = %e, "vector store: failed to create L3 directory");
                    return;
                }
            }
            match serde_json::to_vec_pretty(&fragment) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&l3_path, bytes).await {
                        warn!(error = %e, path = %l3_path.display(), "vector store: failed to persist L3 fragment");
                    }
                }
                Err(e) => warn!(error = %e, "vector store: failed to serialize fragment"),
            }

            let index = class_handle.read().await;
            if let Err(e) = durable::save_class(&root, &class_name, &index).await {
                warn!(error = %e, class = class_name, "vector store: failed to persist class bulk index");
            }
        });

        Ok(())
    }

    /// L1 -> L2 -> L3, promoting a cold hit back through L2 into L1.
    pub async fn get(&self, id: &str) -> Option<VectorFragment> {
        {
            let mut l1 = self.l1.lock().await;
            if let Some(hit) = l1.get(id) {
                return Some(hit);
            }
        }
        if let Some(hit) = self.l2.get(id) {
            let fragment = hit.value().clone();
            let mut l1 = self.l1.lock().await;
            l1.put(fragment.clone());
            return Some(fragment);
        }

        let path = self.l3_path(id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        let fragment: VectorFragment = serde_json::from_slice(&bytes).ok()?;
        self.l2.insert(id.to_string(), fragment.clone());
        let mut l1 = self.l1.lock().await;
        l1.put(fragment.clone());
        Some(fragment)
    }

    /// Brute-force cosine similarity over every class index currently tracked in
    /// memory (populated by `add` or by an explicit `ensure_class_loaded`).
    pub async fn search(&self, query: &[f32], top_k: usize) -> Vec<ScoredFragment> {
        let mut scored = Vec::new();
        for entry in self.classes.iter() {
            let index = entry.value().read().await;
            for fragment in index.fragments() {
                let Some(vector) = &fragment.vector else { continue };
                let score = cosine_similarity(query, vector);
                if score >= self.similarity_threshold {
                    scored.push(ScoredFragment { fragment, score });
                }
            }
        }

        scored.sort_by(|a, b| match b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal) {
            Ordering::Equal => a.fragment.id().cmp(b.fragment.id()),
            other => other,
        });
        scored.truncate(top_k);
        scored
    }

    /// Ensure a class's durable index is loaded into memory so `search` can see it.
    pub async fn ensure_class_loaded(&self, class: &str) {
        self.class_index(class).await;
    }

    /// Preload every class already persisted under `root` so `search` sees them
    /// without waiting for an `add` to touch each one first. Call once at
    /// startup, before serving traffic.
    pub async fn load_existing_classes(&self) -> Result<()> {
        let classes = durable::list_classes(&self.root).await?;
        for class in &classes {
            self.ensure_class_loaded(class).await;
        }
        info!(count = classes.len(), "vector store: preloaded existing classes from disk");
        Ok(())
    }

    /// Remove every fragment whose id starts with `id_prefix` from all tiers.
    pub async fn delete(&self, id_prefix: &str) -> Result<()> {
        {
            let mut l1 = self.l1.lock().await;
            l1.remove_prefix(id_prefix);
        }
        self.l2.retain(|id, _| !id.starts_with(id_prefix));

        for entry in self.classes.iter() {
            let class = entry.key().clone();
            let mut index = entry.value().write().await;
            let removed_ids: Vec<String> = index
                .docs
                .iter()
                .filter(|d| d.id.starts_with(id_prefix))
                .map(|d| d.id.clone())
                .collect();
            index.remove_prefix(id_prefix);
            if !removed_ids.is_empty() {
                durable::save_class(&self.root, &class, &index).await?;
                for id in removed_ids {
                    let _ = tokio::fs::remove_file(self.l3_path(&id)).await;
                }
            }
        }
        Ok(())
    }

    /// Invalidate every fragment sourced from markdown, used to drop a stale
    /// learning corpus before regenerating it.
    pub async fn cleanup_md_vectors(&self) -> Result<usize> {
        let mut removed = 0usize;
        for entry in self.classes.iter() {
            let class = entry.key().clone();
            let mut index = entry.value().write().await;
            let stale: Vec<String> = index
                .fragments()
                .filter(|f| f.is_markdown_sourced())
                .map(|f| f.id().to_string())
                .collect();
            for id in &stale {
                index.remove_prefix(id);
                self.l2.remove(id);
                let mut l1 = self.l1.lock().await;
                l1.remove_prefix(id);
                let _ = tokio::fs::remove_file(self.l3_path(id)).await;
            }
            if !stale.is_empty() {
                durable::save_class(&self.root, &class, &index).await?;
            }
            removed += stale.len();
        }
        info!(removed, "cleaned up markdown-sourced vector fragments");
        Ok(removed)
    }

    pub async fn save_meta(&self, model: &str) -> Result<()> {
        durable::save_meta(
            &self.root,
            &ProjectMeta {
                last_built_at: chrono::Utc::now(),
                model: model.to_string(),
                vector_dim: self.dim,
            },
        )
        .await
    }
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 for a
/// zero-magnitude operand rather than dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[tokio::test]
    async fn add_then_get_hits_l1() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path().to_path_buf(), 3, 1_000_000);
        let fragment = VectorFragment::new("code:a", "fn main() {}", Some(vec![1.0, 0.0, 0.0]));
        store.add(fragment.clone()).await.unwrap();

        let got = store.get("code:a").await.unwrap();
        assert_eq!(got, fragment);
    }

    #[tokio::test]
    async fn get_falls_through_to_l3_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny budget: the second add evicts the first from L1, forcing the next
        // get() to hit L3 once the spawned persist task has landed.
        let store = VectorStore::new(dir.path().to_path_buf(), 3, 1);
        let a = VectorFragment::new("code:a", "aaaa", Some(vec![1.0, 0.0, 0.0]));
        let b = VectorFragment::new("code:b", "bbbb", Some(vec![0.0, 1.0, 0.0]));
        store.add(a.clone()).await.unwrap();
        store.add(b).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let got = store.get("code:a").await.unwrap();
        assert_eq!(got.id(), "code:a");
    }

    #[tokio::test]
    async fn search_ranks_by_descending_similarity_then_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path().to_path_buf(), 2, 1_000_000).with_similarity_threshold(0.0);
        store
            .add(VectorFragment::new("code:a", "a", Some(vec![1.0, 0.0])))
            .await
            .unwrap();
        store
            .add(VectorFragment::new("code:b", "b", Some(vec![0.9, 0.1])))
            .await
            .unwrap();
        store
            .add(VectorFragment::new("code:c", "c", Some(vec![0.0, 1.0])))
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 10).await;
        assert_eq!(results[0].fragment.id(), "code:a");
        assert_eq!(results[1].fragment.id(), "code:b");
        assert_eq!(results.last().unwrap().fragment.id(), "code:c");
    }

    #[tokio::test]
    async fn search_excludes_below_similarity_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path().to_path_buf(), 2, 1_000_000).with_similarity_threshold(0.9);
        store
            .add(VectorFragment::new("code:a", "a", Some(vec![1.0, 0.0])))
            .await
            .unwrap();
        store
            .add(VectorFragment::new("code:c", "c", Some(vec![0.0, 1.0])))
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 10).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fragment.id(), "code:a");
    }

    #[tokio::test]
    async fn delete_removes_matching_prefix_from_all_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path().to_path_buf(), 2, 1_000_000);
        store
            .add(VectorFragment::new("learning:1:question", "q", Some(vec![1.0, 0.0])))
            .await
            .unwrap();
        store
            .add(VectorFragment::new("learning:1:answer", "a", Some(vec![0.0, 1.0])))
            .await
            .unwrap();

        store.delete("learning:1:").await.unwrap();
        assert!(store.get("learning:1:question").await.is_none());
        assert!(store.get("learning:1:answer").await.is_none());
    }

    #[tokio::test]
    async fn cleanup_md_vectors_removes_only_markdown_sourced() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path().to_path_buf(), 2, 1_000_000);
        store
            .add(
                VectorFragment::new("learning:1:question", "q", Some(vec![1.0, 0.0]))
                    .with_source("docs/notes.md"),
            )
            .await
            .unwrap();
        store
            .add(VectorFragment::new("code:a", "a", Some(vec![0.0, 1.0])).with_source("src/a.rs"))
            .await
            .unwrap();

        let removed = store.cleanup_md_vectors().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("learning:1:question").await.is_none());
        assert!(store.get("code:a").await.is_some());
    }
}
