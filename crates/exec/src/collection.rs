//! Collections and the collection catalog
//!
//! A [`Collection`] binds a namespace to its record store, its index
//! catalog, any in-progress index builds, and its plan cache. The
//! [`CollectionCatalog`] owns the namespace map and the catalog generation
//! counter that yielded plans compare on resume.

use dashmap::DashMap;
use rook_core::{Error, NamespaceString, QueryKnobs, Result};
use rook_index::{IndexBuild, IndexCatalog};
use rook_query::{IndexInfo, PlanCache};
use rook_storage::{RecordStore, StorageEngine};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// One collection's runtime state.
pub struct Collection {
    ns: NamespaceString,
    rs: Arc<dyn RecordStore>,
    indexes: IndexCatalog,
    building: RwLock<Vec<Arc<IndexBuild>>>,
    plan_cache: PlanCache,
    /// Bumped on every index create/drop; yielded plans compare it.
    catalog_generation: AtomicU64,
}

impl Collection {
    fn new(ns: NamespaceString, rs: Arc<dyn RecordStore>, knobs: &QueryKnobs) -> Arc<Self> {
        Arc::new(Self {
            ns,
            rs,
            indexes: IndexCatalog::new(),
            building: RwLock::new(Vec::new()),
            plan_cache: PlanCache::new(
                knobs.plan_cache_max_bytes,
                knobs.plan_cache_evict_after_misses,
            ),
            catalog_generation: AtomicU64::new(0),
        })
    }

    /// The collection's namespace.
    pub fn ns(&self) -> &NamespaceString {
        &self.ns
    }

    /// Primary document storage.
    pub fn record_store(&self) -> &Arc<dyn RecordStore> {
        &self.rs
    }

    /// Index runtime state.
    pub fn index_catalog(&self) -> &IndexCatalog {
        &self.indexes
    }

    /// The collection's plan cache.
    pub fn plan_cache(&self) -> &PlanCache {
        &self.plan_cache
    }

    /// In-progress index builds (write path feeds their side queues).
    pub fn builds_in_progress(&self) -> Vec<Arc<IndexBuild>> {
        self.building.read().clone()
    }

    /// Track a build until commit.
    pub fn note_build_started(&self, build: Arc<IndexBuild>) {
        self.building.write().push(build);
        self.note_catalog_change();
    }

    /// Forget a committed or failed build.
    pub fn note_build_finished(&self, build: &Arc<IndexBuild>) {
        self.building
            .write()
            .retain(|b| !Arc::ptr_eq(b, build));
        self.note_catalog_change();
    }

    /// Invalidate cached plans and bump the generation yielded plans check.
    pub fn note_catalog_change(&self) {
        self.plan_cache.clear();
        self.catalog_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Current catalog generation.
    pub fn catalog_generation(&self) -> u64 {
        self.catalog_generation.load(Ordering::SeqCst)
    }

    /// Planner inputs for the ready indexes.
    pub fn index_infos(&self) -> Vec<IndexInfo> {
        self.indexes
            .ready()
            .iter()
            .map(|e| IndexInfo {
                descriptor: e.descriptor().clone(),
                multikey: e.is_multikey(),
            })
            .collect()
    }

    /// Number of live documents.
    pub fn num_records(&self) -> usize {
        self.rs.num_records()
    }
}

/// The namespace → collection map.
pub struct CollectionCatalog {
    engine: Arc<dyn StorageEngine>,
    collections: DashMap<NamespaceString, Arc<Collection>>,
    query_knobs: QueryKnobs,
}

impl CollectionCatalog {
    /// Create a catalog over a storage engine.
    pub fn new(engine: Arc<dyn StorageEngine>, query_knobs: QueryKnobs) -> Self {
        Self {
            engine,
            collections: DashMap::new(),
            query_knobs,
        }
    }

    /// Create a collection. Fails when the namespace exists.
    pub fn create(&self, ns: &NamespaceString) -> Result<Arc<Collection>> {
        if self.collections.contains_key(ns) {
            return Err(Error::NamespaceExists(ns.clone()));
        }
        let rs = self.engine.get_or_create_record_store(&ns.to_string());
        let coll = Collection::new(ns.clone(), rs, &self.query_knobs);
        self.collections.insert(ns.clone(), coll.clone());
        info!(target: "rook::catalog", ns = %ns, "collection created");
        Ok(coll)
    }

    /// Look up a collection.
    pub fn get(&self, ns: &NamespaceString) -> Option<Arc<Collection>> {
        self.collections.get(ns).map(|c| c.clone())
    }

    /// Look up, creating implicitly on first write.
    pub fn get_or_create(&self, ns: &NamespaceString) -> Result<Arc<Collection>> {
        if let Some(c) = self.get(ns) {
            return Ok(c);
        }
        match self.create(ns) {
            Ok(c) => Ok(c),
            // Lost a race; the other creator's collection is fine.
            Err(Error::NamespaceExists(_)) => self
                .get(ns)
                .ok_or_else(|| Error::internal("collection vanished during create race")),
            Err(e) => Err(e),
        }
    }

    /// Drop a collection with its indexes and storage.
    pub fn drop_collection(&self, ns: &NamespaceString) -> Result<()> {
        let (_, coll) = self
            .collections
            .remove(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.clone()))?;
        for entry in coll.index_catalog().all() {
            entry.tree().mark_dropped();
        }
        coll.note_catalog_change();
        self.engine.drop_record_store(&ns.to_string());
        info!(target: "rook::catalog", ns = %ns, "collection dropped");
        Ok(())
    }

    /// All namespaces, sorted.
    pub fn list(&self) -> Vec<NamespaceString> {
        let mut out: Vec<NamespaceString> =
            self.collections.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }
}
