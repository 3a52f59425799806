//! Durable per-project layout backing bulk `search`.
//!
//! One project directory holds `meta.json` plus, per class, a `<class>.docs.json`
//! (fragment metadata, no vectors) and a `<class>.vec.bin` (concatenated row-major
//! float32 vectors, same order as `docs.json`). `docs[i]` must correspond to
//! `vec[i*dim..(i+1)*dim)`; a count mismatch at load time is logged and the shorter
//! length wins.

use super::fragment::{FragmentMeta, VectorFragment};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMeta {
    pub last_built_at: chrono::DateTime<chrono::Utc>,
    pub model: String,
    pub vector_dim: usize,
}

/// In-memory mirror of one class's bulk index, rebuilt incrementally on
/// `add`/`delete` and flushed to disk on demand.
#[derive(Debug, Clone, Default)]
pub struct ClassIndex {
    pub docs: Vec<FragmentMeta>,
    pub vectors: Vec<Vec<f32>>,
}

impl ClassIndex {
    pub fn upsert(&mut self, meta: FragmentMeta, vector: Vec<f32>) {
        if let Some(pos) = self.docs.iter().position(|d| d.id == meta.id) {
            self.docs[pos] = meta;
            self.vectors[pos] = vector;
        } else {
            self.docs.push(meta);
            self.vectors.push(vector);
        }
    }

    pub fn remove_prefix(&mut self, id_prefix: &str) {
        let mut i = 0;
        while i < self.docs.len() {
            if self.docs[i].id.starts_with(id_prefix) {
                self.docs.remove(i);
                self.vectors.remove(i);
            } else {
                i += 1;
            }
        }
    }

    pub fn fragments(&self) -> impl Iterator<Item = VectorFragment> + '_ {
        self.docs
            .iter()
            .zip(self.vectors.iter())
            .map(|(meta, vec)| VectorFragment {
                meta: meta.clone(),
                vector: Some(vec.clone()),
            })
    }
}

fn docs_path(dir: &Path, class: &str) -> PathBuf {
    dir.join(format!("{class}.docs.json"))
}

fn vec_path(dir: &Path, class: &str) -> PathBuf {
    dir.join(format!("{class}.vec.bin"))
}

fn meta_path(dir: &Path) -> PathBuf {
    dir.join("meta.json")
}

pub async fn load_meta(dir: &Path) -> Option<ProjectMeta> {
    let bytes = tokio::fs::read(meta_path(dir)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub async fn save_meta(dir: &Path, meta: &ProjectMeta) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let bytes = serde_json::to_vec_pretty(meta)?;
    tokio::fs::write(meta_path(dir), bytes).await?;
    Ok(())
}

/// Load one class's bulk index from disk. Returns an empty index if either file
/// is absent (a brand new class).
pub async fn load_class(dir: &Path, class: &str, dim: usize) -> ClassIndex {
    let docs: Vec<FragmentMeta> = match tokio::fs::read(docs_path(dir, class)).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => return ClassIndex::default(),
    };

    let raw = match tokio::fs::read(vec_path(dir, class)).await {
        Ok(bytes) => bytes,
        Err(_) => return ClassIndex::default(),
    };

    let row_bytes = dim * 4;
    let available_rows = if row_bytes == 0 { 0 } else { raw.len() / row_bytes };
    let row_count = available_rows.min(docs.len());
    if available_rows != docs.len() {
        warn!(
            class,
            docs_len = docs.len(),
            vec_rows = available_rows,
            "class index docs/vec count mismatch, truncating to shorter length"
        );
    }

    let mut vectors = Vec::with_capacity(row_count);
    for i in 0..row_count {
        let start = i * row_bytes;
        let mut row = Vec::with_capacity(dim);
        for j in 0..dim {
            let off = start + j * 4;
            let bytes: [u8; 4] = raw[off..off + 4].try_into().expect("row_bytes aligned to 4");
            row.push(f32::from_le_bytes(bytes));
        }
        vectors.push(row);
    }

    ClassIndex {
        docs: docs.into_iter().take(row_count).collect(),
        vectors,
    }
}

/// Every class with a durable bulk index under `dir`, recovered from the
/// `<class>.docs.json` filenames on disk (the `.vec.bin` sibling is assumed to
/// exist alongside it; `load_class` tolerates its absence regardless).
pub async fn list_classes(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut classes = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(class) = name.strip_suffix(".docs.json") {
            classes.push(class.to_string());
        }
    }
    Ok(classes)
}

pub async fn save_class(dir: &Path, class: &str, index: &ClassIndex) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let docs_json = serde_json::to_vec_pretty(&index.docs)?;
    tokio::fs::write(docs_path(dir, class), docs_json).await?;

    let mut raw = Vec::with_capacity(index.vectors.iter().map(|v| v.len() * 4).sum());
    for row in &index.vectors {
        for x in row {
            raw.extend_from_slice(&x.to_le_bytes());
        }
    }
    tokio::fs::write(vec_path(dir, class), raw).await?;
    Ok(())
}
