//! The server's wiring
//!
//! `Database` owns every subsystem (storage engine, collection catalog,
//! write path, client cursors, replication coordinator and oplog, the
//! two-phase-commit services) and exposes the operations the command
//! layer runs. Committed writes flow into the replication log through the
//! write path's observer seam; rollback drives the same operations in
//! reverse.

use crate::pipeline;
use parking_lot::Mutex;
use rook_core::{
    Document, Error, NamespaceString, OperationContext, RecordId, Result, ServerOptions, Value,
};
use rook_exec::stages::{DeleteStage, LimitStage, UpdateSpec, UpdateStage};
use rook_exec::{
    Collection, CollectionCatalog, CursorManager, ExecParams, NullObserver, OpObserver,
    PlanExecutor, Stage, WorkResult, WritePath,
};
use rook_index::{IndexBuild, IndexDescriptor};
use rook_query::CanonicalQuery;
use rook_repl::{
    LogicalClock, OpKind, Oplog, OplogEntry, OpTime, ReplSetConfig, ReplicationCoordinator,
    RollbackApply, SigningKeyManager,
};
use rook_shard::{
    ParticipantClient, ShardId, TransactionParticipant, TwoPhaseCoordinator, Vote,
};
use rook_storage::{
    HeapEngine, MetadataStore, StorageEngine, CATALOG_IDENT, COORDINATOR_IDENT, REPL_CONFIG_IDENT,
};
use std::sync::Arc;
use tracing::info;

/// Outcome of a find: the first batch plus a cursor id when more remains.
pub struct FindResult {
    /// First batch of documents.
    pub batch: Vec<Document>,
    /// Non-zero when a server-side cursor stayed open.
    pub cursor_id: u64,
}

/// Observer feeding the replication log.
struct OplogObserver {
    repl: Arc<ReplicationCoordinator>,
    oplog: Arc<Oplog>,
    clock: Arc<LogicalClock>,
    /// Serializes tick+append so optimes enter the log in order.
    append_lock: Mutex<()>,
}

impl OplogObserver {
    fn record(&self, ns: &NamespaceString, rid: RecordId, kind: OpKind) {
        let _guard = self.append_lock.lock();
        let optime = OpTime::new(self.clock.tick(), self.repl.term());
        let entry = OplogEntry {
            optime,
            ns: ns.to_string(),
            rid,
            kind,
        };
        if self.oplog.append(entry).is_ok() {
            self.repl.set_last_applied(optime);
        }
    }
}

impl OpObserver for OplogObserver {
    fn on_insert(&self, ns: &NamespaceString, doc: &Document, rid: RecordId) {
        self.record(ns, rid, OpKind::Insert { doc: doc.clone() });
    }

    fn on_update(&self, ns: &NamespaceString, pre: &Document, post: &Document, rid: RecordId) {
        self.record(
            ns,
            rid,
            OpKind::Update {
                pre: pre.clone(),
                post: post.clone(),
            },
        );
    }

    fn on_delete(&self, ns: &NamespaceString, pre: &Document, rid: RecordId) {
        self.record(ns, rid, OpKind::Delete { pre: pre.clone() });
    }
}

/// The assembled server.
pub struct Database {
    options: ServerOptions,
    catalog: CollectionCatalog,
    write_path: Arc<WritePath>,
    /// Write path without oplog emission, for applying rollback undos.
    silent_write_path: Arc<WritePath>,
    cursors: CursorManager,
    /// Durable enumeration of collections and index definitions.
    catalog_meta: Arc<MetadataStore>,
    repl: Arc<ReplicationCoordinator>,
    oplog: Arc<Oplog>,
    clock: Arc<LogicalClock>,
    keys: Arc<SigningKeyManager>,
    txn_coordinator: TwoPhaseCoordinator,
    participant: Arc<TransactionParticipant>,
}

impl Database {
    /// Bring up every subsystem from the options.
    pub fn open(options: ServerOptions) -> Result<Arc<Database>> {
        let engine: Arc<HeapEngine> = Arc::new(HeapEngine::new());
        let catalog_meta = Arc::new(MetadataStore::open(engine.as_ref(), CATALOG_IDENT));
        let repl_meta = Arc::new(MetadataStore::open(engine.as_ref(), REPL_CONFIG_IDENT));
        let txn_meta = Arc::new(MetadataStore::open(engine.as_ref(), COORDINATOR_IDENT));

        let clock = Arc::new(LogicalClock::open(repl_meta.clone())?);
        let keys = Arc::new(SigningKeyManager::open(repl_meta)?);
        let repl = ReplicationCoordinator::new(0, clock.clone(), keys.clone(), options.repl.clone());
        let oplog = Arc::new(Oplog::new());

        let observer: Arc<dyn OpObserver> = if options.repl_set.is_some() {
            Arc::new(OplogObserver {
                repl: repl.clone(),
                oplog: oplog.clone(),
                clock: clock.clone(),
                append_lock: Mutex::new(()),
            })
        } else {
            Arc::new(NullObserver)
        };

        let db = Arc::new(Database {
            catalog: CollectionCatalog::new(
                engine.clone() as Arc<dyn StorageEngine>,
                options.query.clone(),
            ),
            write_path: Arc::new(WritePath::new(options.write.clone(), observer)),
            silent_write_path: Arc::new(WritePath::new(
                options.write.clone(),
                Arc::new(NullObserver),
            )),
            cursors: CursorManager::new(),
            catalog_meta,
            repl,
            oplog,
            clock,
            keys,
            txn_coordinator: TwoPhaseCoordinator::new(txn_meta.clone()),
            participant: Arc::new(TransactionParticipant::new(txn_meta)),
            options,
        });
        info!(target: "rook::server", port = db.options.port, "database opened");
        Ok(db)
    }

    /// Server options.
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Collection catalog.
    pub fn catalog(&self) -> &CollectionCatalog {
        &self.catalog
    }

    /// Client cursor registry.
    pub fn cursors(&self) -> &CursorManager {
        &self.cursors
    }

    /// Replication coordinator.
    pub fn repl(&self) -> &Arc<ReplicationCoordinator> {
        &self.repl
    }

    /// The replication log.
    pub fn oplog(&self) -> &Arc<Oplog> {
        &self.oplog
    }

    /// The gossiped logical clock.
    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    /// Cluster-time signing keys.
    pub fn keys(&self) -> &Arc<SigningKeyManager> {
        &self.keys
    }

    /// The local two-phase-commit participant.
    pub fn participant(&self) -> &Arc<TransactionParticipant> {
        &self.participant
    }

    /// The two-phase-commit coordinator service.
    pub fn txn_coordinator(&self) -> &TwoPhaseCoordinator {
        &self.txn_coordinator
    }

    /// Execution parameters derived from the options.
    pub fn exec_params(&self) -> ExecParams {
        ExecParams {
            exec: self.options.exec.clone(),
            query: self.options.query.clone(),
            yielding: self.options.yielding.clone(),
            ..ExecParams::default()
        }
    }

    fn collection(&self, ns: &NamespaceString) -> Result<Arc<Collection>> {
        self.catalog
            .get(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.clone()))
    }

    /// Run a find, returning the first batch and possibly a parked cursor.
    #[allow(clippy::too_many_arguments)]
    pub fn find(
        &self,
        ns: &NamespaceString,
        filter: &Document,
        sort: &Document,
        projection: &Document,
        skip: u64,
        limit: u64,
        batch_size: usize,
        opctx: &OperationContext,
    ) -> Result<FindResult> {
        let Some(coll) = self.catalog.get(ns) else {
            // Querying a missing collection returns nothing, like an empty
            // collection.
            return Ok(FindResult {
                batch: Vec::new(),
                cursor_id: 0,
            });
        };
        let query = CanonicalQuery::parse(filter, sort, projection)?;
        let params = self.exec_params();
        let executor = rook_exec::plan_query(&coll, &query, &params, opctx)?;
        let mut root = executor.into_root();
        if skip > 0 {
            root = Box::new(rook_exec::stages::SkipStage::new(root, skip));
        }
        if limit > 0 {
            root = Box::new(LimitStage::new(root, limit));
        }
        let mut executor = PlanExecutor::from_root(root, &coll, &params);

        let mut batch = Vec::with_capacity(batch_size.min(128));
        let mut exhausted = false;
        while batch.len() < batch_size {
            match executor.next(opctx)? {
                Some(doc) => batch.push(doc),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        let cursor_id = if exhausted {
            0
        } else {
            self.cursors.register(ns.clone(), executor)
        };
        Ok(FindResult { batch, cursor_id })
    }

    /// Look up a collection, creating it implicitly and enumerating it in
    /// the durable catalog on first use.
    fn collection_for_write(&self, ns: &NamespaceString) -> Result<Arc<Collection>> {
        let known = self.catalog.get(ns).is_some();
        let coll = self.catalog.get_or_create(ns)?;
        if !known {
            self.catalog_meta
                .put(&format!("coll/{}", ns), &ns.to_string())?;
        }
        Ok(coll)
    }

    /// Insert a batch of documents, creating the collection implicitly.
    pub fn insert_docs(
        &self,
        ns: &NamespaceString,
        docs: Vec<Document>,
        opctx: &OperationContext,
    ) -> Result<u64> {
        let coll = self.collection_for_write(ns)?;
        let mut inserted = 0u64;
        for doc in docs {
            self.write_path.insert(&coll, doc, opctx)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Apply one update specification; returns `(matched, modified)`.
    pub fn update_docs(
        &self,
        ns: &NamespaceString,
        filter: &Document,
        update: &Document,
        multi: bool,
        opctx: &OperationContext,
    ) -> Result<(u64, u64)> {
        let coll = self.collection(ns)?;
        let spec = UpdateSpec::parse(update)?;
        let query = CanonicalQuery::parse(filter, &Document::new(), &Document::new())?;
        let params = self.exec_params();
        let mut root = rook_exec::plan_query(&coll, &query, &params, opctx)?.into_root();
        if !multi {
            root = Box::new(LimitStage::new(root, 1));
        }
        let mut stage = UpdateStage::new(root, spec, coll.clone(), self.write_path.clone());
        let modified = drain_stage(&mut stage, opctx)?;
        Ok((modified, modified))
    }

    /// Apply one delete specification; returns the number removed.
    pub fn delete_docs(
        &self,
        ns: &NamespaceString,
        filter: &Document,
        limit_one: bool,
        opctx: &OperationContext,
    ) -> Result<u64> {
        let coll = self.collection(ns)?;
        let query = CanonicalQuery::parse(filter, &Document::new(), &Document::new())?;
        let params = self.exec_params();
        let mut root = rook_exec::plan_query(&coll, &query, &params, opctx)?.into_root();
        if limit_one {
            root = Box::new(LimitStage::new(root, 1));
        }
        let mut stage = DeleteStage::new(root, coll.clone(), self.write_path.clone());
        drain_stage(&mut stage, opctx)
    }

    /// findAndModify: update or remove one document, returning its pre- or
    /// post-image.
    #[allow(clippy::too_many_arguments)]
    pub fn find_and_modify(
        &self,
        ns: &NamespaceString,
        filter: &Document,
        sort: &Document,
        update: Option<&Document>,
        remove: bool,
        return_new: bool,
        opctx: &OperationContext,
    ) -> Result<Option<Document>> {
        let coll = self.collection(ns)?;
        let query = CanonicalQuery::parse(filter, sort, &Document::new())?;
        let params = self.exec_params();
        let root = rook_exec::plan_query(&coll, &query, &params, opctx)?.into_root();
        let root = Box::new(LimitStage::new(root, 1));

        if remove {
            let mut stage = DeleteStage::new(root, coll.clone(), self.write_path.clone());
            return next_doc(&mut stage, opctx);
        }
        let update =
            update.ok_or_else(|| Error::bad_value("findAndModify needs update or remove"))?;
        let spec = UpdateSpec::parse(update)?;
        // The update stage emits the post-image; capture the pre-image
        // first when the caller wants the old document.
        if return_new {
            let mut stage = UpdateStage::new(root, spec, coll.clone(), self.write_path.clone());
            next_doc(&mut stage, opctx)
        } else {
            let mut pre_capture = PreImageCapture {
                child: root,
                captured: None,
            };
            let first = next_doc(&mut pre_capture, opctx)?;
            let Some(pre) = first else {
                return Ok(None);
            };
            let rid = pre_capture.captured.ok_or_else(|| {
                Error::internal("pre-image capture lost its record id")
            })?;
            let post = spec.apply(&pre);
            self.write_path.update(&coll, rid, post, opctx)?;
            Ok(Some(pre))
        }
    }

    /// Create an index through the multi-phase build.
    pub fn create_index(
        &self,
        ns: &NamespaceString,
        descriptor: IndexDescriptor,
        opctx: &OperationContext,
    ) -> Result<()> {
        let coll = self.collection_for_write(ns)?;
        let index_key = format!("index/{}/{}", ns, descriptor.name);
        let build = IndexBuild::start(coll.index_catalog(), descriptor)?;
        coll.note_build_started(build.clone());
        let result = build
            .scan_and_load(coll.record_store().as_ref(), opctx)
            .and_then(|_| build.commit(opctx));
        match result {
            Ok(()) => {
                self.catalog_meta
                    .put(&index_key, build.entry().descriptor().as_ref())?;
                coll.note_build_finished(&build);
                Ok(())
            }
            Err(e) => {
                // A failed build unregisters its half-built index.
                let name = build.entry().descriptor().name.clone();
                let _ = coll.index_catalog().drop_index(&name);
                coll.note_build_finished(&build);
                Err(e)
            }
        }
    }

    /// Drop an index by name.
    pub fn drop_index(&self, ns: &NamespaceString, name: &str) -> Result<()> {
        let coll = self.collection(ns)?;
        coll.index_catalog().drop_index(name)?;
        self.catalog_meta.delete(&format!("index/{}/{}", ns, name))?;
        coll.note_catalog_change();
        Ok(())
    }

    /// Durably enumerated collections and indexes (diagnostics and
    /// startup recovery).
    pub fn catalog_entries(&self) -> Vec<String> {
        let mut out = self.catalog_meta.keys_with_prefix("coll/");
        out.extend(self.catalog_meta.keys_with_prefix("index/"));
        out
    }

    /// Run an aggregation pipeline.
    pub fn aggregate(
        &self,
        ns: &NamespaceString,
        stages: &[Value],
        opctx: &OperationContext,
    ) -> Result<Vec<Document>> {
        let Some(coll) = self.catalog.get(ns) else {
            return Ok(Vec::new());
        };
        pipeline::run_pipeline(self, &coll, ns, stages, opctx)
    }

    /// The write path (pipeline building blocks need it).
    pub fn write_path(&self) -> &Arc<WritePath> {
        &self.write_path
    }

    /// Initiate the replica set from a seed config; every seed must be
    /// reachable (single-process deployments probe trivially true).
    pub fn repl_set_initiate(&self, config: ReplSetConfig) -> Result<()> {
        self.repl.initiate(config, |_| true)
    }

    /// Roll local history back to the common point with a sync source.
    pub fn rollback_to(&self, remote_chain: &[OpTime]) -> Result<rook_repl::RollbackStats> {
        let applier = LocalRollback { db: self };
        rook_repl::rollback_to_common_point(&self.repl, &self.oplog, remote_chain, &applier)
    }

    /// A participant client that treats every shard id as this node
    /// (single-process clusters and tests).
    pub fn loopback_participants(&self) -> LoopbackParticipants<'_> {
        LoopbackParticipants { db: self }
    }
}

/// Pull a stage to EOF, counting advances.
fn drain_stage(stage: &mut dyn Stage, opctx: &OperationContext) -> Result<u64> {
    let mut n = 0u64;
    loop {
        match stage.work(opctx)? {
            WorkResult::Advanced(_) => n += 1,
            WorkResult::Paused => {}
            WorkResult::Eof => return Ok(n),
        }
    }
}

/// Pull the first document from a stage.
fn next_doc(stage: &mut dyn Stage, opctx: &OperationContext) -> Result<Option<Document>> {
    loop {
        match stage.work(opctx)? {
            WorkResult::Advanced(member) => {
                return Ok(member.doc);
            }
            WorkResult::Paused => {}
            WorkResult::Eof => return Ok(None),
        }
    }
}

/// Pass-through stage remembering the record id of what it forwarded.
struct PreImageCapture {
    child: Box<dyn Stage>,
    captured: Option<RecordId>,
}

impl Stage for PreImageCapture {
    fn name(&self) -> &'static str {
        "PRE_IMAGE_CAPTURE"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        match self.child.work(opctx)? {
            WorkResult::Advanced(member) => {
                self.captured = member.rid;
                Ok(WorkResult::Advanced(member))
            }
            other => Ok(other),
        }
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        self.child.restore_state(opctx)
    }

    fn stats_tree(&self) -> rook_exec::StatsNode {
        self.child.stats_tree()
    }
}

/// Applies rollback undos through the (oplog-silent) write path.
struct LocalRollback<'a> {
    db: &'a Database,
}

impl RollbackApply for LocalRollback<'_> {
    fn undo_insert(&self, ns: &str, rid: RecordId) -> Result<()> {
        let ns = NamespaceString::parse(ns)?;
        let coll = self.db.collection(&ns)?;
        let opctx = OperationContext::new();
        self.db.silent_write_path.delete(&coll, rid, &opctx)?;
        Ok(())
    }

    fn undo_update(&self, ns: &str, rid: RecordId, pre: &Document) -> Result<()> {
        let ns = NamespaceString::parse(ns)?;
        let coll = self.db.collection(&ns)?;
        let opctx = OperationContext::new();
        self.db
            .silent_write_path
            .update(&coll, rid, pre.clone(), &opctx)
    }

    fn undo_delete(&self, ns: &str, _rid: RecordId, pre: &Document) -> Result<()> {
        let ns = NamespaceString::parse(ns)?;
        let coll = self.db.collection(&ns)?;
        let opctx = OperationContext::new();
        self.db
            .silent_write_path
            .insert(&coll, pre.clone(), &opctx)?;
        Ok(())
    }
}

/// Routes every participant RPC to the local participant service.
pub struct LoopbackParticipants<'a> {
    db: &'a Database,
}

impl ParticipantClient for LoopbackParticipants<'_> {
    fn prepare(&self, _shard: &ShardId, txn_id: &str) -> Option<Vote> {
        let secs = self.db.clock.now().secs.max(1);
        self.db
            .participant
            .prepare(txn_id, secs)
            .ok()
            .map(|prepare_ts| Vote::Commit { prepare_ts })
    }

    fn commit(&self, _shard: &ShardId, txn_id: &str, commit_ts: rook_core::Timestamp) -> bool {
        self.db.participant.commit(txn_id, commit_ts).is_ok()
    }

    fn abort(&self, _shard: &ShardId, txn_id: &str) -> bool {
        self.db.participant.abort(txn_id).is_ok()
    }
}

