//! Fragment types shared by every tier of the vector store.

use serde::{Deserialize, Serialize};

/// Everything about a fragment except its vector. Kept separate from
/// `VectorFragment` so the durable `docs.json` side of the bulk layout never
/// carries float payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMeta {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// A fragment as stored in L1/L2/L3. `vector` is `None` for fragments that exist
/// only as metadata (e.g. freshly created but not yet embedded); `search` skips
/// those.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VectorFragment {
    #[serde(flatten)]
    pub meta: FragmentMeta,
    pub vector: Option<Vec<f32>>,
}

impl VectorFragment {
    pub fn new(id: impl Into<String>, text: impl Into<String>, vector: Option<Vec<f32>>) -> Self {
        Self {
            meta: FragmentMeta {
                id: id.into(),
                text: text.into(),
                source: None,
                tag: None,
            },
            vector,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.meta.tag = Some(tag.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Approximate on-heap size, used by the L1 tier's byte budget.
    pub fn approx_bytes(&self) -> usize {
        self.meta.id.len()
            + self.meta.text.len()
            + self.meta.source.as_ref().map(String::len).unwrap_or(0)
            + self.meta.tag.as_ref().map(String::len).unwrap_or(0)
            + self.vector.as_ref().map(|v| v.len() * 4).unwrap_or(0)
    }

    /// A fragment's class is the segment before the first `:` in its id
    /// (`"learning:abc:question"` → `"learning"`); ids with no `:` fall into
    /// `"default"`.
    pub fn class_of(id: &str) -> &str {
        id.split(':').next().filter(|s| !s.is_empty()).unwrap_or("default")
    }

    /// `true` if this fragment was produced from a markdown source, the predicate
    /// `cleanupMdVectors` uses to invalidate a stale learning corpus.
    pub fn is_markdown_sourced(&self) -> bool {
        self.meta
            .source
            .as_deref()
            .map(|s| s.ends_with(".md") || s.ends_with(".markdown"))
            .unwrap_or(false)
    }

    /// Relative path of this fragment's L3 file: `.` in the id becomes a path
    /// separator, so `"code.src.main"` lives at `code/src/main.json`.
    pub fn l3_relative_path(id: &str) -> std::path::PathBuf {
        let mut path = std::path::PathBuf::new();
        for segment in id.split('.') {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }
}
