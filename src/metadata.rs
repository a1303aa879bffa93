//! Array key/value metadata with time travel.
//!
//! Every put or delete writes one JSON document to `__meta/<name>`, where the
//! name carries the write timestamp. Opening the metadata at a window replays
//! the visible documents in name order: later documents override earlier ones
//! and deletes remove keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    directory::ArrayDirectory,
    error::Error,
    fragment::{FragmentName, META_DIR},
    timestamp::TimestampRange,
    vfs::{Path, Vfs},
};

/// One recorded change of a key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub(crate) enum MetadataOp {
    Put(Value),
    Delete,
}

/// Contents of one `__meta` file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct MetadataDocument {
    #[serde(default)]
    ops: BTreeMap<String, MetadataOp>,
}

impl MetadataDocument {
    pub(crate) fn put(key: impl Into<String>, value: Value) -> Self {
        let mut doc = Self::default();
        doc.ops.insert(key.into(), MetadataOp::Put(value));
        doc
    }

    pub(crate) fn delete(key: impl Into<String>) -> Self {
        let mut doc = Self::default();
        doc.ops.insert(key.into(), MetadataOp::Delete);
        doc
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Fold a later document into this one, keeping the last change per key.
    pub(crate) fn merge(&mut self, later: MetadataDocument) {
        self.ops.extend(later.ops);
    }
}

/// Array metadata as visible at one timestamp window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayMetadata {
    values: BTreeMap<String, Value>,
}

impl ArrayMetadata {
    /// Value of one key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Keys and values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` when no key is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn apply(&mut self, doc: MetadataDocument) {
        for (key, op) in doc.ops {
            match op {
                MetadataOp::Put(value) => {
                    self.values.insert(key, value);
                }
                MetadataOp::Delete => {
                    self.values.remove(&key);
                }
            }
        }
    }
}

/// Replay the metadata documents visible in `dir`.
pub(crate) async fn load(vfs: &dyn Vfs, dir: &ArrayDirectory) -> Result<ArrayMetadata, Error> {
    let mut metadata = ArrayMetadata::default();
    for meta in dir.array_meta_uris() {
        let bytes = vfs.read_all(&meta.uri).await?;
        metadata.apply(MetadataDocument::decode(&bytes)?);
    }
    Ok(metadata)
}

/// Write one document stamped with `range`. Returns its name.
pub(crate) async fn store(
    vfs: &dyn Vfs,
    array_uri: &Path,
    range: TimestampRange,
    doc: &MetadataDocument,
) -> Result<FragmentName, Error> {
    let name = FragmentName::generate(range);
    let dir = array_uri.child(META_DIR);
    vfs.create_dir(&dir).await?;
    vfs.write(&dir.child(name.to_string().as_str()), doc.encode()?).await?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn later_documents_override_and_delete() {
        let mut metadata = ArrayMetadata::default();
        metadata.apply(MetadataDocument::put("a", json!(1)));
        metadata.apply(MetadataDocument::put("b", json!("x")));
        metadata.apply(MetadataDocument::put("a", json!(2)));
        metadata.apply(MetadataDocument::delete("b"));
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get("a"), Some(&json!(2)));
        assert_eq!(metadata.get("b"), None);
    }

    #[test]
    fn merged_document_keeps_last_change() {
        let mut doc = MetadataDocument::put("k", json!(null));
        doc.merge(MetadataDocument::delete("k"));
        doc.merge(MetadataDocument::put("j", json!([1, 2])));
        let decoded = MetadataDocument::decode(&doc.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, doc);

        let mut metadata = ArrayMetadata::default();
        metadata.apply(MetadataDocument::put("k", json!(true)));
        metadata.apply(decoded);
        assert_eq!(metadata.iter().collect::<Vec<_>>(), vec![("j", &json!([1, 2]))]);
    }
}
