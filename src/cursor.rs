//! Batch cursors and change-stream resumption (spec §4.10).
//!
//! Grounded on the teacher's `cursor/{mod,common}.rs` and `change_stream/
//! mod.rs`, collapsed into a single `Cursor` type. The teacher drives
//! iteration through a hand-rolled `futures_core::Stream` backed by an
//! in-flight `getMore` future; this core's `Dispatcher::issue_command` is
//! already a plain `async fn`, so `Cursor::next` is one too — pulling in
//! `futures-core`'s `Stream` machinery here would only wrap an `async fn`
//! in `Pin`/`Poll` ceremony it doesn't need (dropped, see DESIGN.md).

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bson::{doc, Document, Timestamp};

use crate::{
    dispatcher::{Dispatcher, OperationKind},
    error::{ErrorKind, Result},
    selection_criteria::SelectionCriteria,
    session::ClientSession,
};

/// A fully qualified collection name (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn parse(full: &str) -> Option<Self> {
        let (db, collection) = full.split_once('.')?;
        Some(Self {
            db: db.to_string(),
            collection: collection.to_string(),
        })
    }
}

/// The `{cursorId, ns, firstBatch}` shape returned by `find`/`aggregate`/
/// `listIndexes` (spec §4.10).
#[derive(Debug, Clone)]
pub struct CursorSpecification {
    pub id: i64,
    pub ns: Namespace,
    pub initial_batch: VecDeque<Document>,
    pub post_batch_resume_token: Option<Document>,
}

impl CursorSpecification {
    /// Parses the `cursor` subdocument of a command reply.
    pub fn from_reply(reply: &Document) -> Result<Self> {
        let cursor = reply.get_document("cursor").map_err(|_| ErrorKind::InvalidResponse {
            message: "reply did not contain a cursor field".into(),
        })?;
        let id = cursor.get_i64("id").unwrap_or(0);
        let ns = cursor
            .get_str("ns")
            .ok()
            .and_then(Namespace::parse)
            .ok_or_else(|| ErrorKind::InvalidResponse {
                message: "cursor.ns missing or malformed".into(),
            })?;
        let batch_key = if cursor.contains_key("firstBatch") {
            "firstBatch"
        } else {
            "nextBatch"
        };
        let initial_batch = cursor
            .get_array(batch_key)
            .map(|docs| docs.iter().filter_map(|b| b.as_document().cloned()).collect())
            .unwrap_or_default();
        let post_batch_resume_token = cursor.get_document("postBatchResumeToken").ok().cloned();
        Ok(Self {
            id,
            ns,
            initial_batch,
            post_batch_resume_token,
        })
    }
}

/// Tracks the state a change stream needs to rewrite and reissue its
/// initiating aggregate after a resumable error (spec §4.10).
#[derive(Debug, Clone)]
struct ChangeStreamResumeState {
    aggregate_command: Document,
    resume_token: Option<Document>,
    operation_time: Option<Timestamp>,
}

/// A batch cursor driving `getMore`/`killCursors` pagination, with optional
/// change-stream resumability (spec §4.10).
pub struct Cursor {
    dispatcher: Arc<Dispatcher>,
    ns: Namespace,
    id: i64,
    buffer: VecDeque<Document>,
    batch_size: Option<u32>,
    max_time: Option<Duration>,
    criteria: SelectionCriteria,
    exhausted: bool,
    resume_state: Option<ChangeStreamResumeState>,
}

impl Cursor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        spec: CursorSpecification,
        criteria: SelectionCriteria,
        batch_size: Option<u32>,
        max_time: Option<Duration>,
    ) -> Self {
        Self {
            dispatcher,
            exhausted: spec.id == 0,
            ns: spec.ns,
            id: spec.id,
            buffer: spec.initial_batch,
            batch_size,
            max_time,
            criteria,
            resume_state: None,
        }
    }

    /// Wraps a cursor opened from a change-stream `aggregate`, enabling
    /// resume-on-error (spec §4.10).
    pub fn with_change_stream_resume(mut self, aggregate_command: Document) -> Self {
        let resume_token = self
            .buffer
            .back()
            .and_then(|doc| doc.get_document("_id").ok())
            .cloned();
        self.resume_state = Some(ChangeStreamResumeState {
            aggregate_command,
            resume_token,
            operation_time: None,
        });
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    fn is_change_stream(&self) -> bool {
        self.resume_state.is_some()
    }

    fn record_resume_state(&mut self, reply: &Document) {
        let last_id = reply
            .get_document("cursor")
            .ok()
            .and_then(|c| c.get_document("postBatchResumeToken").ok())
            .cloned()
            .or_else(|| self.buffer.back().and_then(|doc| doc.get_document("_id").ok().cloned()));
        let operation_time = reply.get_timestamp("operationTime").ok();
        if let Some(state) = self.resume_state.as_mut() {
            if let Some(token) = last_id {
                state.resume_token = Some(token);
            }
            if let Some(time) = operation_time {
                state.operation_time = Some(time);
            }
        }
    }

    /// Returns the next document, driving `getMore` as the buffer empties
    /// and, for change streams, resuming once on a resumable error
    /// (spec §4.10).
    pub async fn next(&mut self, session: Option<&mut ClientSession>) -> Option<Result<Document>> {
        if let Some(doc) = self.buffer.pop_front() {
            return Some(Ok(doc));
        }
        if self.exhausted {
            return None;
        }

        match self.get_more(session).await {
            Ok(()) => self.buffer.pop_front().map(Ok),
            Err(e) if self.is_change_stream() && e.is_resumable() => match self.resume().await {
                Ok(()) => self.buffer.pop_front().map(Ok),
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        }
    }

    async fn get_more(&mut self, session: Option<&mut ClientSession>) -> Result<()> {
        let mut command = doc! {
            "getMore": self.id,
            "collection": self.ns.collection.clone(),
        };
        if let Some(batch_size) = self.batch_size {
            command.insert("batchSize", batch_size as i32);
        }
        if let Some(max_time) = self.max_time {
            command.insert("maxTimeMS", max_time.as_millis() as i64);
        }

        let reply = self
            .dispatcher
            .issue_command(&self.ns.db, command, OperationKind::Read, &self.criteria, session)
            .await?;

        self.apply_get_more_reply(&reply)
    }

    fn apply_get_more_reply(&mut self, reply: &Document) -> Result<()> {
        let cursor = reply.get_document("cursor").map_err(|_| ErrorKind::InvalidResponse {
            message: "getMore reply missing cursor field".into(),
        })?;
        self.id = cursor.get_i64("id").unwrap_or(0);
        self.exhausted = self.id == 0;
        let batch = cursor
            .get_array("nextBatch")
            .map(|docs| docs.iter().filter_map(|b| b.as_document().cloned()).collect())
            .unwrap_or_default();
        self.buffer = batch;
        if self.is_change_stream() {
            self.record_resume_state(reply);
        }
        Ok(())
    }

    /// Rewrites and reissues the original aggregate with `resumeAfter`/
    /// `startAtOperationTime` (spec §4.10).
    async fn resume(&mut self) -> Result<()> {
        let state = self
            .resume_state
            .clone()
            .expect("resume only called on a change stream cursor");

        let mut command = state.aggregate_command.clone();
        let pipeline = command.get_array_mut("pipeline").map_err(|_| ErrorKind::InvalidResponse {
            message: "change stream command missing pipeline".into(),
        })?;
        if let Some(first) = pipeline.first_mut() {
            if let Some(change_stream_stage) = first.as_document_mut() {
                if let Ok(stage) = change_stream_stage.get_document_mut("$changeStream") {
                    stage.remove("resumeAfter");
                    stage.remove("startAfter");
                    stage.remove("startAtOperationTime");
                    if let Some(token) = &state.resume_token {
                        stage.insert("resumeAfter", token.clone());
                    } else if let Some(time) = state.operation_time {
                        stage.insert("startAtOperationTime", time);
                    }
                }
            }
        }

        let reply = self
            .dispatcher
            .issue_command(&self.ns.db, command, OperationKind::Read, &self.criteria, None)
            .await?;
        let spec = CursorSpecification::from_reply(&reply)?;
        self.id = spec.id;
        self.exhausted = spec.id == 0;
        self.buffer = spec.initial_batch;
        Ok(())
    }

    /// Best-effort `killCursors`, sent when the caller drops an
    /// unexhausted cursor (spec §4.10).
    pub async fn kill(&mut self) {
        if self.exhausted || self.id == 0 {
            return;
        }
        let command = doc! {
            "killCursors": self.ns.collection.clone(),
            "cursors": [self.id],
        };
        let _ = self
            .dispatcher
            .issue_command(&self.ns.db, command, OperationKind::Read, &self.criteria, None)
            .await;
        self.exhausted = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn namespace_parses_db_and_collection() {
        let ns = Namespace::parse("mydb.mycoll").unwrap();
        assert_eq!(ns.db, "mydb");
        assert_eq!(ns.collection, "mycoll");
    }

    #[test]
    fn cursor_specification_reads_first_batch() {
        let reply = doc! {
            "ok": 1.0,
            "cursor": {
                "id": 0i64,
                "ns": "db.coll",
                "firstBatch": [{ "x": 1 }, { "x": 2 }],
            },
        };
        let spec = CursorSpecification::from_reply(&reply).unwrap();
        assert_eq!(spec.id, 0);
        assert_eq!(spec.initial_batch.len(), 2);
        assert_eq!(spec.ns.collection, "coll");
    }

    #[test]
    fn cursor_specification_rejects_missing_cursor() {
        let reply = doc! { "ok": 1.0 };
        assert!(CursorSpecification::from_reply(&reply).is_err());
    }
}
