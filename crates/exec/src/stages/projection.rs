//! Projection stages
//!
//! The plain projection shapes fetched documents by an inclusion or
//! exclusion spec. The covered variant materializes its output straight
//! from decoded index keys, never touching the record store. The columnar
//! variant evaluates per-field predicates against extracted fields and
//! drops the member before materializing anything when one fails.

use crate::stage::{Stage, StageStats, StatsNode, WorkResult, WsMember};
use rook_core::{Document, Error, OperationContext, Result, Value};
use rook_query::Matcher;

enum ProjectionMode {
    /// Shape fetched documents.
    Plain,
    /// Build output from index keys only.
    Covered,
    /// Plain, preceded by per-field filters applied before materializing.
    Columnar(Vec<(String, Matcher)>),
}

/// Shape-transform the stream.
pub struct ProjectionStage {
    child: Box<dyn Stage>,
    spec: Document,
    mode: ProjectionMode,
    stats: StageStats,
}

impl ProjectionStage {
    /// Plain projection of fetched documents.
    pub fn new(child: Box<dyn Stage>, spec: Document) -> Self {
        Self {
            child,
            spec,
            mode: ProjectionMode::Plain,
            stats: StageStats::default(),
        }
    }

    /// Covered projection from index keys.
    pub fn new_covered(child: Box<dyn Stage>, spec: Document) -> Self {
        Self {
            child,
            spec,
            mode: ProjectionMode::Covered,
            stats: StageStats::default(),
        }
    }

    /// Columnar projection: per-field filters run before materialization.
    pub fn new_columnar(
        child: Box<dyn Stage>,
        spec: Document,
        field_filters: Vec<(String, Matcher)>,
    ) -> Self {
        Self {
            child,
            spec,
            mode: ProjectionMode::Columnar(field_filters),
            stats: StageStats::default(),
        }
    }

    fn included_paths(&self) -> Vec<&str> {
        self.spec
            .iter()
            .filter(|(p, v)| p != "_id" && is_truthy(v))
            .map(|(p, _)| p.as_str())
            .collect()
    }

    fn id_suppressed(&self) -> bool {
        matches!(self.spec.get("_id"), Some(v) if !is_truthy(v))
    }

    fn is_inclusion(&self) -> bool {
        self.spec.iter().any(|(p, v)| p != "_id" && is_truthy(v))
    }

    fn project_doc(&self, doc: &Document) -> Document {
        let mut out = Document::new();
        if self.is_inclusion() {
            if !self.id_suppressed() {
                if let Some(id) = doc.get("_id") {
                    out.push("_id", id.clone());
                }
            }
            for path in self.included_paths() {
                if let Some(v) = doc.get_path(path) {
                    push_path(&mut out, path, v.clone());
                }
            }
        } else {
            // Exclusion: copy everything except the named fields.
            let excluded: Vec<&str> = self
                .spec
                .iter()
                .filter(|(_, v)| !is_truthy(v))
                .map(|(p, _)| p.as_str())
                .collect();
            for (name, v) in doc.iter() {
                if !excluded.contains(&name.as_str()) {
                    out.push(name.clone(), v.clone());
                }
            }
        }
        out
    }

    fn project_covered(&self, member: &WsMember) -> Result<Document> {
        let keys = member
            .index_keys
            .as_ref()
            .ok_or_else(|| Error::internal("covered projection without index keys"))?;
        let mut out = Document::new();
        for path in self.included_paths() {
            if let Some((_, v)) = keys.iter().find(|(p, _)| p == path) {
                push_path(&mut out, path, v.clone());
            }
        }
        Ok(out)
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Int32(0) | Value::Int64(0) | Value::Boolean(false) => false,
        Value::Double(d) => *d != 0.0,
        _ => true,
    }
}

/// Insert `value` at a dotted path, rebuilding intermediate documents.
fn push_path(out: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => out.set(path, value),
        Some((head, rest)) => {
            let mut inner = match out.remove(head) {
                Some(Value::Document(d)) => d,
                _ => Document::new(),
            };
            push_path(&mut inner, rest, value);
            out.set(head, Value::Document(inner));
        }
    }
}

impl Stage for ProjectionStage {
    fn name(&self) -> &'static str {
        match self.mode {
            ProjectionMode::Plain => "PROJECTION",
            ProjectionMode::Covered => "PROJECTION_COVERED",
            ProjectionMode::Columnar(_) => "PROJECTION_COLUMNAR",
        }
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        match self.child.work(opctx)? {
            WorkResult::Advanced(mut member) => {
                let projected = match &self.mode {
                    ProjectionMode::Covered => self.project_covered(&member)?,
                    ProjectionMode::Plain => {
                        let doc = member
                            .doc
                            .as_ref()
                            .ok_or_else(|| Error::internal("projection without document"))?;
                        self.project_doc(doc)
                    }
                    ProjectionMode::Columnar(filters) => {
                        let doc = member
                            .doc
                            .as_ref()
                            .ok_or_else(|| Error::internal("projection without document"))?;
                        for (path, matcher) in filters {
                            let mut probe = Document::new();
                            if let Some(v) = doc.get_path(path) {
                                probe.push(path.clone(), v.clone());
                            }
                            if !matcher.matches(&probe) {
                                return Ok(WorkResult::Paused);
                            }
                        }
                        self.project_doc(doc)
                    }
                };
                member.doc = Some(projected);
                member.index_keys = None;
                self.stats.advances += 1;
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

    fn stats_tree(&self) -> StatsNode {
        StatsNode {
            name: self.name(),
            stats: self.stats,
            children: vec![self.child.stats_tree()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::WorkResult;
    use rook_core::{doc, RecordId};
    use rook_query::Predicate;

    struct OneShot {
        member: Option<WsMember>,
    }

    impl Stage for OneShot {
        fn name(&self) -> &'static str {
            "ONESHOT"
        }
        fn work(&mut self, _opctx: &OperationContext) -> Result<WorkResult> {
            Ok(match self.member.take() {
                Some(m) => WorkResult::Advanced(m),
                None => WorkResult::Eof,
            })
        }
        fn save_state(&mut self) {}
        fn restore_state(&mut self, _opctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn stats_tree(&self) -> crate::stage::StatsNode {
            crate::stage::StatsNode {
                name: "ONESHOT",
                stats: Default::default(),
                children: Vec::new(),
            }
        }
    }

    fn source(doc: Document) -> Box<dyn Stage> {
        Box::new(OneShot {
            member: Some(WsMember::from_doc(RecordId(1), doc)),
        })
    }

    fn pull(stage: &mut dyn Stage) -> Option<Document> {
        let opctx = OperationContext::new();
        loop {
            match stage.work(&opctx).unwrap() {
                WorkResult::Advanced(m) => return m.doc,
                WorkResult::Paused => {}
                WorkResult::Eof => return None,
            }
        }
    }

    #[test]
    fn inclusion_keeps_id_by_default() {
        let input = doc! { "_id": 9, "a": 1, "b": { "c": 2 }, "z": 3 };
        let mut stage = ProjectionStage::new(source(input), doc! { "a": 1, "b.c": 1 });
        let out = pull(&mut stage).unwrap();
        assert_eq!(out, doc! { "_id": 9, "a": 1, "b": { "c": 2 } });
    }

    #[test]
    fn exclusion_removes_named_fields() {
        let input = doc! { "_id": 9, "a": 1, "z": 3 };
        let mut stage = ProjectionStage::new(source(input), doc! { "z": 0 });
        let out = pull(&mut stage).unwrap();
        assert_eq!(out, doc! { "_id": 9, "a": 1 });
    }

    #[test]
    fn covered_builds_from_index_keys() {
        let member = WsMember::from_index_key(
            RecordId(1),
            vec![("a".into(), Value::Int32(5)), ("b".into(), Value::Int32(6))],
        );
        let mut stage = ProjectionStage::new_covered(
            Box::new(OneShot {
                member: Some(member),
            }),
            doc! { "a": 1, "_id": 0 },
        );
        let out = pull(&mut stage).unwrap();
        assert_eq!(out, doc! { "a": 5 });
    }

    #[test]
    fn columnar_filters_before_materializing() {
        let filters = vec![(
            "a".to_string(),
            Matcher::new(Predicate::parse(&doc! { "a": { "$gt": 3 } }).unwrap()).unwrap(),
        )];
        let mut keep = ProjectionStage::new_columnar(
            source(doc! { "a": 5, "b": 1 }),
            doc! { "a": 1, "_id": 0 },
            filters,
        );
        assert_eq!(pull(&mut keep).unwrap(), doc! { "a": 5 });

        let filters = vec![(
            "a".to_string(),
            Matcher::new(Predicate::parse(&doc! { "a": { "$gt": 3 } }).unwrap()).unwrap(),
        )];
        let mut drop_stage = ProjectionStage::new_columnar(
            source(doc! { "a": 1, "b": 1 }),
            doc! { "a": 1, "_id": 0 },
            filters,
        );
        assert!(pull(&mut drop_stage).is_none());
    }
}
