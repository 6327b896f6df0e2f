use crate::events::RuntimeEvent;
use crate::instance::ProcessInstance;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Durable-state capability supplied by the host application.
///
/// The engine calls `checkpoint` at every state transition boundary (token
/// consumed or emitted, scope pushed or popped, instance terminal) with a
/// serializable snapshot of the instance, and appends audit events through
/// the same trait. The record layout is the backend's concern; this core
/// ships only the in-memory backend.
#[async_trait]
pub trait Persistor: Send + Sync {
    async fn checkpoint(&self, snapshot: &ProcessInstance) -> Result<()>;
    async fn load(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>>;
}
