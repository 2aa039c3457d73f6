//! Durable session state.
//!
//! `SessionStore` is the set of operations the orchestrator performs against
//! persistence. Every call is a fresh read-then-write against the store; the
//! orchestrator never holds a session record across a suspension point.
//! `DbHandle` implements it on SQLite.

pub mod db;
pub mod models;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use vds_common::{Approval, SessionStatus};

use crate::errors::OrchestratorError;
pub use db::{DbHandle, SessionDb};
pub use models::*;

pub type StoreResult<T> = std::result::Result<T, OrchestratorError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, new: NewSession) -> StoreResult<Session>;

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>>;

    async fn list_sessions(&self, status: Option<SessionStatus>) -> StoreResult<Vec<Session>>;

    async fn update_progress(&self, id: &str, update: ProgressUpdate) -> StoreResult<Session>;

    async fn append_message(&self, id: &str, message: NewMessage) -> StoreResult<Message>;

    async fn append_artifact(&self, id: &str, artifact: NewArtifact) -> StoreResult<Artifact>;

    async fn append_audit_event(&self, id: &str, event: NewAuditEvent)
    -> StoreResult<AuditEvent>;

    /// Accepted only while the session is at a checkpoint with no approval
    /// already pending.
    async fn record_approval(&self, id: &str, approval: Approval) -> StoreResult<Session>;

    /// Atomically read and clear the transient approval field.
    async fn take_approval(&self, id: &str) -> StoreResult<Option<Approval>>;

    async fn commit_step(&self, id: &str, commit: StepCommit) -> StoreResult<Session>;

    async fn fail_session(&self, id: &str, failure: FailureRecord) -> StoreResult<Session>;

    async fn complete_session(&self, id: &str, completion: Completion) -> StoreResult<Session>;

    async fn list_messages(&self, id: &str) -> StoreResult<Vec<Message>>;

    async fn list_artifacts(&self, id: &str) -> StoreResult<Vec<Artifact>>;

    async fn list_audit_events(&self, id: &str) -> StoreResult<Vec<AuditEvent>>;

    /// Notified whenever an approval is recorded through this store, so a
    /// waiting checkpoint can re-check before its next poll.
    fn approval_signal(&self) -> Arc<Notify>;

    async fn require_session(&self, id: &str) -> StoreResult<Session> {
        self.get_session(id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound { id: id.to_string() })
    }
}

#[async_trait]
impl SessionStore for DbHandle {
    async fn create_session(&self, new: NewSession) -> StoreResult<Session> {
        self.call(move |db| db.create_session(&new)).await
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let id = id.to_string();
        self.call(move |db| db.get_session(&id)).await
    }

    async fn list_sessions(&self, status: Option<SessionStatus>) -> StoreResult<Vec<Session>> {
        self.call(move |db| db.list_sessions(status)).await
    }

    async fn update_progress(&self, id: &str, update: ProgressUpdate) -> StoreResult<Session> {
        let id = id.to_string();
        self.call(move |db| db.update_progress(&id, &update)).await
    }

    async fn append_message(&self, id: &str, message: NewMessage) -> StoreResult<Message> {
        let id = id.to_string();
        self.call(move |db| db.append_message(&id, &message)).await
    }

    async fn append_artifact(&self, id: &str, artifact: NewArtifact) -> StoreResult<Artifact> {
        let id = id.to_string();
        self.call(move |db| db.append_artifact(&id, &artifact)).await
    }

    async fn append_audit_event(
        &self,
        id: &str,
        event: NewAuditEvent,
    ) -> StoreResult<AuditEvent> {
        let id = id.to_string();
        self.call(move |db| db.append_audit_event(&id, &event)).await
    }

    async fn record_approval(&self, id: &str, approval: Approval) -> StoreResult<Session> {
        let id = id.to_string();
        let session = self
            .call(move |db| db.record_approval(&id, &approval))
            .await?;
        self.approval_notify().notify_waiters();
        Ok(session)
    }

    async fn take_approval(&self, id: &str) -> StoreResult<Option<Approval>> {
        let id = id.to_string();
        self.call(move |db| db.take_approval(&id)).await
    }

    async fn commit_step(&self, id: &str, commit: StepCommit) -> StoreResult<Session> {
        let id = id.to_string();
        self.call(move |db| db.commit_step(&id, &commit)).await
    }

    async fn fail_session(&self, id: &str, failure: FailureRecord) -> StoreResult<Session> {
        let id = id.to_string();
        self.call(move |db| db.fail_session(&id, &failure)).await
    }

    async fn complete_session(&self, id: &str, completion: Completion) -> StoreResult<Session> {
        let id = id.to_string();
        self.call(move |db| db.complete_session(&id, &completion))
            .await
    }

    async fn list_messages(&self, id: &str) -> StoreResult<Vec<Message>> {
        let id = id.to_string();
        self.call(move |db| db.list_messages(&id)).await
    }

    async fn list_artifacts(&self, id: &str) -> StoreResult<Vec<Artifact>> {
        let id = id.to_string();
        self.call(move |db| db.list_artifacts(&id)).await
    }

    async fn list_audit_events(&self, id: &str) -> StoreResult<Vec<AuditEvent>> {
        let id = id.to_string();
        self.call(move |db| db.list_audit_events(&id)).await
    }

    fn approval_signal(&self) -> Arc<Notify> {
        self.approval_notify()
    }
}
