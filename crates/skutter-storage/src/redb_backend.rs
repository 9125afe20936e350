use crate::store::{apply_binding, bound_requests, node_key, pod_key};
use crate::{Binding, ClusterStore, EventBusConfig, Result, StorageError};
use k8s_openapi::api::core::v1::{Node, Pod};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use skutter_core::{ClusterEvent, UnitKey};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

// Table definitions
const PODS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");
const NODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const REVISION_KEY: &str = "revision";

/// redb-backed cluster store
pub struct RedbStore {
    db: Arc<Database>,
    event_tx: broadcast::Sender<ClusterEvent>,
}

impl RedbStore {
    /// Open (or create) a store at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_event_bus_config(path, EventBusConfig::default())
    }

    pub fn with_event_bus_config<P: AsRef<Path>>(path: P, config: EventBusConfig) -> Result<Self> {
        info!("Opening redb database at: {}", path.as_ref().display());

        let db = Database::create(path.as_ref())?;

        // Create tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PODS_TABLE)?;
            let _ = write_txn.open_table(NODES_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        info!("redb database initialized successfully");

        let (event_tx, _) = broadcast::channel(config.capacity);
        Ok(Self {
            db: Arc::new(db),
            event_tx,
        })
    }

    fn publish(&self, event: ClusterEvent) {
        let _ = self.event_tx.send(event);
    }

    fn next_revision(txn: &WriteTransaction) -> Result<String> {
        let mut meta = txn.open_table(META_TABLE)?;
        let current = meta.get(REVISION_KEY)?.map(|v| v.value()).unwrap_or(0);
        let next = current + 1;
        meta.insert(REVISION_KEY, next)?;
        Ok(next.to_string())
    }

    fn get_object<T: DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;

        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_objects<T: DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let mut results = Vec::new();
        for entry in table.iter()? {
            let (_key, value) = entry?;
            results.push(serde_json::from_slice(value.value())?);
        }

        debug!("Listed {} objects", results.len());
        Ok(results)
    }
}

impl ClusterStore for RedbStore {
    fn get_pod(&self, key: &UnitKey) -> Result<Option<Pod>> {
        self.get_object(PODS_TABLE, &key.storage_key())
    }

    fn list_pods(&self) -> Result<Vec<Pod>> {
        self.list_objects(PODS_TABLE)
    }

    fn put_pod(&self, mut pod: Pod) -> Result<Pod> {
        let key = pod_key(&pod)?;
        let storage_key = key.storage_key();
        pod.metadata.namespace = Some(key.namespace.clone());

        let write_txn = self.db.begin_write()?;
        let old: Option<Pod> = {
            pod.metadata.resource_version = Some(Self::next_revision(&write_txn)?);
            let mut table = write_txn.open_table(PODS_TABLE)?;
            let old = match table.get(storage_key.as_str())? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };
            let data = serde_json::to_vec(&pod)?;
            table.insert(storage_key.as_str(), data.as_slice())?;
            old
        };
        write_txn.commit()?;

        debug!("Stored pod {}", key);
        self.publish(match old {
            Some(old) => ClusterEvent::PodUpdated {
                old,
                new: pod.clone(),
            },
            None => ClusterEvent::PodAdded { pod: pod.clone() },
        });
        Ok(pod)
    }

    fn delete_pod(&self, key: &UnitKey) -> Result<Option<Pod>> {
        let write_txn = self.db.begin_write()?;
        let removed: Option<Pod> = {
            let mut table = write_txn.open_table(PODS_TABLE)?;
            let removed = table.remove(key.storage_key().as_str())?;
            match removed {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            }
        };
        write_txn.commit()?;

        if let Some(pod) = &removed {
            debug!("Deleted pod {}", key);
            self.publish(ClusterEvent::PodDeleted { pod: pod.clone() });
        }
        Ok(removed)
    }

    fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.get_object(NODES_TABLE, name)
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        self.list_objects(NODES_TABLE)
    }

    fn put_node(&self, mut node: Node) -> Result<Node> {
        let name = node_key(&node)?;

        let write_txn = self.db.begin_write()?;
        let old: Option<Node> = {
            node.metadata.resource_version = Some(Self::next_revision(&write_txn)?);
            let mut table = write_txn.open_table(NODES_TABLE)?;
            let old = match table.get(name.as_str())? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };
            let data = serde_json::to_vec(&node)?;
            table.insert(name.as_str(), data.as_slice())?;
            old
        };
        write_txn.commit()?;

        self.publish(match old {
            Some(old) => ClusterEvent::NodeUpdated {
                old,
                new: node.clone(),
            },
            None => ClusterEvent::NodeAdded { node: node.clone() },
        });
        Ok(node)
    }

    fn delete_node(&self, name: &str) -> Result<Option<Node>> {
        let write_txn = self.db.begin_write()?;
        let removed: Option<Node> = {
            let mut table = write_txn.open_table(NODES_TABLE)?;
            let removed = table.remove(name)?;
            match removed {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            }
        };
        write_txn.commit()?;

        if let Some(node) = &removed {
            self.publish(ClusterEvent::NodeDeleted { node: node.clone() });
        }
        Ok(removed)
    }

    fn bind_pod(&self, binding: &Binding) -> Result<Pod> {
        let storage_key = binding.key.storage_key();

        // Read, validate and write in one transaction so a concurrent binding
        // to the same node cannot slip between the capacity check and the write.
        let write_txn = self.db.begin_write()?;
        let (old, mut bound) = {
            let nodes = write_txn.open_table(NODES_TABLE)?;
            let node: Option<Node> = match nodes.get(binding.node_name.as_str())? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };

            let pods = write_txn.open_table(PODS_TABLE)?;
            let old: Pod = match pods.get(storage_key.as_str())? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(StorageError::not_found(binding.key.to_string())),
            };

            let mut all = Vec::new();
            for entry in pods.iter()? {
                let (_key, value) = entry?;
                all.push(serde_json::from_slice::<Pod>(value.value())?);
            }
            let already_bound = bound_requests(&all, &binding.node_name);
            let bound = apply_binding(old.clone(), binding, node.as_ref(), already_bound)?;
            (old, bound)
        };

        bound.metadata.resource_version = Some(Self::next_revision(&write_txn)?);
        {
            let data = serde_json::to_vec(&bound)?;
            let mut pods = write_txn.open_table(PODS_TABLE)?;
            pods.insert(storage_key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        debug!("Bound pod {} to node {}", binding.key, binding.node_name);
        self.publish(ClusterEvent::PodUpdated {
            old,
            new: bound.clone(),
        });
        Ok(bound)
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{node, pod};
    use tempfile::tempdir;

    #[test]
    fn test_redb_store_pod_roundtrip() {
        let dir = tempdir().unwrap();
        let store = RedbStore::new(dir.path().join("test.redb")).unwrap();

        let stored = store.put_pod(pod("a", "1", "1Gi")).unwrap();
        assert_eq!(stored.metadata.resource_version.as_deref(), Some("1"));

        let key = UnitKey::new("default", "a");
        let fetched = store.get_pod(&key).unwrap().unwrap();
        assert_eq!(fetched.metadata.name.as_deref(), Some("a"));

        assert!(store.delete_pod(&key).unwrap().is_some());
        assert!(store.get_pod(&key).unwrap().is_none());
        assert!(store.delete_pod(&key).unwrap().is_none());
    }

    #[test]
    fn test_redb_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let store = RedbStore::new(&path).unwrap();
            store.put_node(node("node1", "4", "8Gi")).unwrap();
            store.put_pod(pod("a", "1", "1Gi")).unwrap();
            store.put_pod(pod("b", "1", "1Gi")).unwrap();
            store
                .bind_pod(&Binding::new(UnitKey::new("default", "a"), "node1"))
                .unwrap();
        }

        let store = RedbStore::new(&path).unwrap();
        let pending = store.list_pending_pods().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].metadata.name.as_deref(), Some("b"));
        assert_eq!(store.list_nodes().unwrap().len(), 1);

        // Revision counter continues after reopen
        let again = store.put_pod(pod("c", "1", "1Gi")).unwrap();
        assert_eq!(again.metadata.resource_version.as_deref(), Some("5"));
    }

    #[test]
    fn test_redb_store_bind_conflicts() {
        let dir = tempdir().unwrap();
        let store = RedbStore::new(dir.path().join("test.redb")).unwrap();
        store.put_node(node("node1", "2", "4Gi")).unwrap();
        store.put_pod(pod("a", "2", "1Gi")).unwrap();
        store.put_pod(pod("b", "1", "1Gi")).unwrap();

        store
            .bind_pod(&Binding::new(UnitKey::new("default", "a"), "node1"))
            .unwrap();

        let err = store
            .bind_pod(&Binding::new(UnitKey::new("default", "b"), "node1"))
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        let err = store
            .bind_pod(&Binding::new(UnitKey::new("default", "b"), "node9"))
            .unwrap_err();
        assert!(err.to_string().contains("no longer exists"));
    }
}
