//! Per-kind metadata handed to caches: names, scope and secondary indexers.

use std::fmt;
use std::sync::Arc;

use kube::{Resource, ResourceExt};

use crate::crds::labels::SITEPOD_LABEL;

/// Index of objects by their `sitepod` label value.
pub const SITEPOD_INDEX: &str = "sitepod";
/// Index of objects by uid.
pub const UID_INDEX: &str = "uid";

/// Pure function from an object to the index values it should be found under.
pub type IndexFn<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Describes one resource kind to a cache.
pub struct ResourceKind<K> {
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    pub indexers: Vec<(String, IndexFn<K>)>,
}

impl<K> Clone for ResourceKind<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            plural: self.plural.clone(),
            namespaced: self.namespaced,
            indexers: self.indexers.clone(),
        }
    }
}

impl<K> fmt::Debug for ResourceKind<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceKind")
            .field("kind", &self.kind)
            .field("plural", &self.plural)
            .field("namespaced", &self.namespaced)
            .field(
                "indexers",
                &self.indexers.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<K: Resource<DynamicType = ()> + 'static> ResourceKind<K> {
    #[must_use]
    pub fn namespaced() -> Self {
        Self::new(true)
    }

    #[must_use]
    pub fn cluster() -> Self {
        Self::new(false)
    }

    fn new(namespaced: bool) -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
            namespaced,
            indexers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_indexer(
        mut self,
        name: &str,
        f: impl Fn(&K) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.indexers.push((name.to_string(), Arc::new(f)));
        self
    }

    /// Index by the `sitepod` label.
    #[must_use]
    pub fn with_sitepod_index(self) -> Self {
        self.with_indexer(SITEPOD_INDEX, |obj: &K| {
            obj.labels()
                .get(SITEPOD_LABEL)
                .map(|v| vec![v.clone()])
                .unwrap_or_default()
        })
    }

    /// Index by uid.
    #[must_use]
    pub fn with_uid_index(self) -> Self {
        self.with_indexer(UID_INDEX, |obj: &K| obj.uid().into_iter().collect())
    }
}
