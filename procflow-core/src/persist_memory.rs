use crate::events::RuntimeEvent;
use crate::instance::ProcessInstance;
use crate::persist::Persistor;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// In-memory `Persistor` backend. Used by the test suite and by embedders
/// that run without durable storage.
#[derive(Default)]
pub struct MemoryPersistor {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    snapshots: BTreeMap<Uuid, ProcessInstance>,
    checkpoints: BTreeMap<Uuid, u64>,
    events: BTreeMap<Uuid, Vec<RuntimeEvent>>,
}

impl MemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of checkpoints taken for an instance.
    pub fn checkpoint_count(&self, instance_id: Uuid) -> u64 {
        self.lock().checkpoints.get(&instance_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Persistor for MemoryPersistor {
    async fn checkpoint(&self, snapshot: &ProcessInstance) -> Result<()> {
        let mut inner = self.lock();
        *inner.checkpoints.entry(snapshot.instance_id).or_insert(0) += 1;
        inner.snapshots.insert(snapshot.instance_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>> {
        Ok(self.lock().snapshots.get(&instance_id).cloned())
    }

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let mut inner = self.lock();
        let log = inner.events.entry(instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let inner = self.lock();
        let log = inner.events.get(&instance_id).cloned().unwrap_or_default();
        Ok(log
            .into_iter()
            .enumerate()
            .map(|(i, e)| (i as u64 + 1, e))
            .filter(|(seq, _)| *seq >= from_seq)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VariableMap;

    #[tokio::test]
    async fn checkpoint_then_load_round_trips() {
        let store = MemoryPersistor::new();
        let instance = ProcessInstance::new("p", [0u8; 32], VariableMap::new());
        let id = instance.instance_id;

        store.checkpoint(&instance).await.unwrap();
        store.checkpoint(&instance).await.unwrap();

        let loaded = store.load(id).await.unwrap().expect("snapshot present");
        assert_eq!(loaded.definition_id, "p");
        assert_eq!(store.checkpoint_count(id), 2);
        assert!(store.load(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_log_is_append_only_and_sequenced() {
        let store = MemoryPersistor::new();
        let id = Uuid::now_v7();

        let seq1 = store
            .append_event(id, &RuntimeEvent::ScopeCompleted { scope: id })
            .await
            .unwrap();
        let seq2 = store
            .append_event(id, &RuntimeEvent::Completed { at: 1 })
            .await
            .unwrap();
        assert_eq!((seq1, seq2), (1, 2));

        let all = store.read_events(id, 1).await.unwrap();
        assert_eq!(all.len(), 2);
        let tail = store.read_events(id, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(matches!(tail[0].1, RuntimeEvent::Completed { .. }));
    }
}
