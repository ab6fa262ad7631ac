//! The session: a unit of work over the document store.
//!
//! A session is an actor holding an in-memory staging area: documents
//! loaded from or destined for the server, staged deletions, and deferred
//! raw commands. Nothing touches the network until `save_changes` emits the
//! whole staged state as a single batch, whose results are then reconciled
//! back into the tracked documents.
//!
//! The inbox is processed strictly serially, so load/store/delete/commit
//! against one session are linearizable. Errors from the request layer are
//! propagated to the caller verbatim.

mod document;

pub use document::{DeletedEntity, DocumentInfo};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use vellum_common::{
    BatchCommand, BatchResultType, Command, Conventions, DeleteCommandData, GetDocumentsCommand,
    PutCommandData, Result, SaveChangesData, VellumError,
};

use crate::executor::RequestOptions;
use crate::store::DocumentStore;

/// What one commit did, as reconciled from the server's `Results`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveChangesSummary {
    pub puts: usize,
    pub deletes: usize,
    pub deferred: usize,
    /// `"Type"` discriminators the session does not understand; noted per
    /// item, never failing the batch.
    pub not_implemented: Vec<String>,
}

enum SessionMessage {
    Load {
        id: String,
        includes: Option<Vec<String>>,
        respond_to: oneshot::Sender<Result<Value>>,
    },
    LoadMany {
        ids: Vec<String>,
        respond_to: oneshot::Sender<Result<HashMap<String, Value>>>,
    },
    Store {
        entity: Value,
        id: Option<String>,
        change_vector: Option<String>,
        respond_to: oneshot::Sender<Result<String>>,
    },
    Delete {
        id: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Defer {
        commands: Vec<Value>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    SaveChanges {
        respond_to: oneshot::Sender<Result<SaveChangesSummary>>,
    },
    TrackedDocument {
        id: String,
        respond_to: oneshot::Sender<Option<DocumentInfo>>,
    },
    NumberOfRequests {
        respond_to: oneshot::Sender<u32>,
    },
}

/// Cheap-clone handle to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Loads one document by id.
    ///
    /// An id the session already tracks is served from the session without
    /// a network call; that includes documents staged by `store` and not
    /// yet committed.
    pub async fn load(&self, id: impl Into<String>) -> Result<Value> {
        self.load_with_includes(id, None).await
    }

    /// Loads one document, asking the server to resolve include paths
    /// alongside it. Included documents become tracked too.
    pub async fn load_with_includes(
        &self,
        id: impl Into<String>,
        includes: Option<Vec<String>>,
    ) -> Result<Value> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(SessionMessage::Load {
                id: id.into(),
                includes,
                respond_to,
            })
            .map_err(|_| VellumError::ChannelClosed)?;
        reply.await.map_err(|_| VellumError::ChannelClosed)?
    }

    /// Loads several documents at once, batching server requests by the
    /// `max_ids_to_catch` hint. Tracked ids are served from the session;
    /// ids the server does not know are simply absent from the result.
    pub async fn load_many(&self, ids: Vec<String>) -> Result<HashMap<String, Value>> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(SessionMessage::LoadMany { ids, respond_to })
            .map_err(|_| VellumError::ChannelClosed)?;
        reply.await.map_err(|_| VellumError::ChannelClosed)?
    }

    /// Stages an entity for the next commit. The id is taken from the
    /// entity's `"id"` field. Returns the resolved document id.
    pub async fn store(&self, entity: Value) -> Result<String> {
        self.store_inner(entity, None, None).await
    }

    /// Stages an entity under an explicit id.
    pub async fn store_with_id(&self, entity: Value, id: impl Into<String>) -> Result<String> {
        self.store_inner(entity, Some(id.into()), None).await
    }

    /// Stages an entity under an explicit id with a known change-vector.
    /// The vector is retained either way, but only sent with the commit
    /// when the store uses optimistic concurrency.
    pub async fn store_with_change_vector(
        &self,
        entity: Value,
        id: impl Into<String>,
        change_vector: impl Into<String>,
    ) -> Result<String> {
        self.store_inner(entity, Some(id.into()), Some(change_vector.into()))
            .await
    }

    async fn store_inner(
        &self,
        entity: Value,
        id: Option<String>,
        change_vector: Option<String>,
    ) -> Result<String> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(SessionMessage::Store {
                entity,
                id,
                change_vector,
                respond_to,
            })
            .map_err(|_| VellumError::ChannelClosed)?;
        reply.await.map_err(|_| VellumError::ChannelClosed)?
    }

    /// Stages a deletion by id, dropping any in-session staging for it.
    pub async fn delete(&self, id: impl Into<String>) -> Result<()> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(SessionMessage::Delete {
                id: id.into(),
                respond_to,
            })
            .map_err(|_| VellumError::ChannelClosed)?;
        reply.await.map_err(|_| VellumError::ChannelClosed)?
    }

    /// Stages a deletion for an entity, resolving its id the way `store`
    /// does.
    pub async fn delete_entity(&self, entity: &Value) -> Result<()> {
        match entity.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => self.delete(id).await,
            _ => Err(VellumError::NoValidIdInformed),
        }
    }

    /// Appends raw commands included verbatim at the front of the next
    /// batch.
    pub async fn defer(&self, commands: Vec<Value>) -> Result<()> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(SessionMessage::Defer {
                commands,
                respond_to,
            })
            .map_err(|_| VellumError::ChannelClosed)?;
        reply.await.map_err(|_| VellumError::ChannelClosed)?
    }

    /// Commits everything staged as one batch and reconciles the results.
    pub async fn save_changes(&self) -> Result<SaveChangesSummary> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(SessionMessage::SaveChanges { respond_to })
            .map_err(|_| VellumError::ChannelClosed)?;
        reply.await.map_err(|_| VellumError::ChannelClosed)?
    }

    /// The session's view of one tracked document, if any.
    pub async fn tracked_document(&self, id: impl Into<String>) -> Option<DocumentInfo> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(SessionMessage::TrackedDocument {
                id: id.into(),
                respond_to,
            })
            .ok()?;
        reply.await.ok().flatten()
    }

    /// How many network round-trips this session has issued.
    pub async fn number_of_requests(&self) -> u32 {
        let (respond_to, reply) = oneshot::channel();
        if self
            .tx
            .send(SessionMessage::NumberOfRequests { respond_to })
            .is_err()
        {
            return 0;
        }
        reply.await.unwrap_or(0)
    }
}

/// The session actor. Constructed through [`DocumentSession::spawn`].
pub struct DocumentSession {
    id: String,
    store: DocumentStore,
    conventions: Arc<Conventions>,
    documents_by_id: HashMap<String, DocumentInfo>,
    deleted_entities: Vec<DeletedEntity>,
    defer_commands: Vec<Value>,
    number_of_requests: u32,
    inbox: mpsc::UnboundedReceiver<SessionMessage>,
}

impl DocumentSession {
    pub fn spawn(id: String, store: DocumentStore, conventions: Arc<Conventions>) -> SessionHandle {
        let (tx, inbox) = mpsc::unbounded_channel();
        let session = Self {
            id: id.clone(),
            store,
            conventions,
            documents_by_id: HashMap::new(),
            deleted_entities: Vec::new(),
            defer_commands: Vec::new(),
            number_of_requests: 0,
            inbox,
        };
        tokio::spawn(session.run());
        SessionHandle { id, tx }
    }

    async fn run(mut self) {
        debug!(session = %self.id, "session opened");
        while let Some(message) = self.inbox.recv().await {
            match message {
                SessionMessage::Load {
                    id,
                    includes,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.load(id, includes).await);
                }
                SessionMessage::LoadMany { ids, respond_to } => {
                    let _ = respond_to.send(self.load_many(ids).await);
                }
                SessionMessage::Store {
                    entity,
                    id,
                    change_vector,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.store_entity(entity, id, change_vector));
                }
                SessionMessage::Delete { id, respond_to } => {
                    let _ = respond_to.send(self.delete(id));
                }
                SessionMessage::Defer {
                    commands,
                    respond_to,
                } => {
                    self.defer_commands.extend(commands);
                    let _ = respond_to.send(Ok(()));
                }
                SessionMessage::SaveChanges { respond_to } => {
                    let _ = respond_to.send(self.save_changes().await);
                }
                SessionMessage::TrackedDocument { id, respond_to } => {
                    let _ = respond_to.send(self.documents_by_id.get(&id).cloned());
                }
                SessionMessage::NumberOfRequests { respond_to } => {
                    let _ = respond_to.send(self.number_of_requests);
                }
            }
        }
        debug!(session = %self.id, "session closed");
    }

    async fn load(&mut self, id: String, includes: Option<Vec<String>>) -> Result<Value> {
        if let Some(doc) = self.documents_by_id.get(&id) {
            // already stored or loaded in this session; informational, not
            // an error
            debug!(session = %self.id, %id, "serving already-tracked document");
            return Ok(doc.entity.clone());
        }

        let mut command = GetDocumentsCommand::single(id.as_str());
        if let Some(includes) = includes {
            command = command.with_includes(includes);
        }

        // the round trip counts even when it comes back as an error
        self.number_of_requests += 1;
        let response = self
            .store
            .execute(
                Command::GetDocuments(command),
                Vec::new(),
                RequestOptions::default(),
            )
            .await?;

        self.track_results(&response.body);
        match self.documents_by_id.get(&id) {
            Some(doc) => Ok(doc.entity.clone()),
            None => Err(VellumError::DocumentNotFound),
        }
    }

    async fn load_many(&mut self, ids: Vec<String>) -> Result<HashMap<String, Value>> {
        let mut found = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        for id in ids {
            if let Some(doc) = self.documents_by_id.get(&id) {
                found.insert(id, doc.entity.clone());
            } else if !missing.contains(&id) {
                missing.push(id);
            }
        }

        for chunk in missing.chunks(self.conventions.max_ids_to_catch.max(1)) {
            let command = GetDocumentsCommand {
                ids: chunk.to_vec(),
                ..Default::default()
            };
            self.number_of_requests += 1;
            let response = self
                .store
                .execute(
                    Command::GetDocuments(command),
                    Vec::new(),
                    RequestOptions::default(),
                )
                .await?;
            self.track_results(&response.body);
            for id in chunk {
                if let Some(doc) = self.documents_by_id.get(id) {
                    found.insert(id.clone(), doc.entity.clone());
                }
            }
        }
        Ok(found)
    }

    fn track_results(&mut self, body: &Value) {
        if let Some(results) = body.get("Results").and_then(Value::as_array) {
            for result in results {
                self.track_document(result);
            }
        }
        if let Some(includes) = body.get("Includes").and_then(Value::as_object) {
            for included in includes.values() {
                self.track_document(included);
            }
        }
    }

    fn track_document(&mut self, result: &Value) {
        if result.is_null() {
            return;
        }
        let Some(metadata) = result.get("@metadata") else {
            warn!(session = %self.id, "server document without @metadata, not tracking");
            return;
        };
        let Some(id) = metadata.get("@id").and_then(Value::as_str) else {
            warn!(session = %self.id, "server document without @id, not tracking");
            return;
        };
        // the session's staged copy wins over the server view, and a
        // staged deletion keeps the id out of the tracked set
        if self.documents_by_id.contains_key(id)
            || self.deleted_entities.iter().any(|d| d.id == id)
        {
            return;
        }

        let mut entity = result.clone();
        if let Some(object) = entity.as_object_mut() {
            object.remove("@metadata");
        }
        self.documents_by_id.insert(
            id.to_string(),
            DocumentInfo::from_server(id, entity, metadata.clone()),
        );
    }

    fn store_entity(
        &mut self,
        entity: Value,
        id: Option<String>,
        change_vector: Option<String>,
    ) -> Result<String> {
        if entity.is_null() {
            return Err(VellumError::NullEntity);
        }
        let id = match id.or_else(|| {
            entity
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
        }) {
            Some(id) if !id.is_empty() => id,
            _ => return Err(VellumError::NoValidIdInformed),
        };

        match self.documents_by_id.get_mut(&id) {
            Some(doc) => {
                doc.entity = entity;
                if change_vector.is_some() {
                    doc.change_vector = change_vector;
                }
            }
            None => {
                self.documents_by_id.insert(
                    id.clone(),
                    DocumentInfo::new_pending(id.clone(), entity, change_vector),
                );
            }
        }
        // storing again cancels a staged deletion of the same id
        self.deleted_entities.retain(|d| d.id != id);
        Ok(id)
    }

    fn delete(&mut self, id: String) -> Result<()> {
        let change_vector = self
            .documents_by_id
            .remove(&id)
            .and_then(|doc| doc.change_vector);
        if !self.deleted_entities.iter().any(|d| d.id == id) {
            self.deleted_entities.push(DeletedEntity { id, change_vector });
        }
        Ok(())
    }

    async fn save_changes(&mut self) -> Result<SaveChangesSummary> {
        let max = self.conventions.max_number_of_requests_per_session;
        if self.number_of_requests >= max {
            return Err(VellumError::MaxRequestsExceeded(max));
        }

        let data = self.build_save_changes_data();
        if data.is_empty() {
            debug!(session = %self.id, "nothing staged, save_changes is a no-op");
            return Ok(SaveChangesSummary::default());
        }

        let deferred = data.deferred_commands_count;
        let response = self
            .store
            .execute(
                Command::Batch(BatchCommand::new(data.commands)),
                Vec::new(),
                RequestOptions::default(),
            )
            .await?;

        self.number_of_requests += 1;
        self.defer_commands.clear();
        self.deleted_entities.clear();

        let summary = self.reconcile(&response.body, deferred);
        info!(
            session = %self.id,
            puts = summary.puts,
            deletes = summary.deletes,
            deferred = summary.deferred,
            "changes saved"
        );
        Ok(summary)
    }

    /// Assembles the batch in commit order: deferred commands verbatim,
    /// then deletions, then puts for every changed document.
    fn build_save_changes_data(&self) -> SaveChangesData {
        let optimistic = self.conventions.use_optimistic_concurrency;
        let mut data = SaveChangesData::with_deferred(self.defer_commands.clone());

        for deleted in &self.deleted_entities {
            let change_vector = if optimistic {
                deleted.change_vector.clone()
            } else {
                None
            };
            data.push_delete(DeleteCommandData::new(deleted.id.as_str(), change_vector));
        }

        let mut changed: Vec<&DocumentInfo> = self
            .documents_by_id
            .values()
            .filter(|doc| doc.has_changes())
            .collect();
        changed.sort_by(|a, b| a.id.cmp(&b.id));
        for doc in changed {
            let change_vector = if optimistic {
                doc.change_vector.clone()
            } else {
                None
            };
            data.push_put(PutCommandData::new(
                doc.id.as_str(),
                change_vector,
                doc.document_for_put(),
            ));
        }

        data
    }

    /// Folds the server's per-command results back into session state.
    fn reconcile(&mut self, body: &Value, deferred: usize) -> SaveChangesSummary {
        let mut summary = SaveChangesSummary {
            deferred,
            ..Default::default()
        };
        let Some(results) = body.get("Results").and_then(Value::as_array) else {
            warn!(session = %self.id, "batch response without Results array");
            return summary;
        };

        for result in results {
            match BatchResultType::of(result) {
                BatchResultType::Put => {
                    summary.puts += 1;
                    self.reconcile_put(result);
                }
                BatchResultType::Delete => summary.deletes += 1,
                BatchResultType::NotImplemented(kind) => {
                    warn!(session = %self.id, %kind, "batch result type not implemented");
                    summary.not_implemented.push(kind);
                }
            }
        }
        summary
    }

    fn reconcile_put(&mut self, result: &Value) {
        let Some(id) = result.get("@id").and_then(Value::as_str) else {
            return;
        };
        let Some(doc) = self.documents_by_id.get_mut(id) else {
            return;
        };

        if let Some(change_vector) = result.get("@change-vector").and_then(Value::as_str) {
            doc.change_vector = Some(change_vector.to_string());
        }

        let mut metadata = Map::new();
        if let Some(fields) = result.as_object() {
            for (key, value) in fields {
                if key.starts_with('@') {
                    metadata.insert(key.clone(), value.clone());
                }
            }
        }
        doc.metadata = Value::Object(metadata);

        // the commit confirmed this exact state; snapshots catch up to it
        doc.original_metadata = doc.metadata.clone();
        doc.original_value = Some(doc.entity.clone());
    }
}
