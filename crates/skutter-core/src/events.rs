use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};

/// A mutation observed in the cluster state store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterEvent {
    PodAdded { pod: Pod },
    PodUpdated { old: Pod, new: Pod },
    PodDeleted { pod: Pod },
    NodeAdded { node: Node },
    NodeUpdated { old: Node, new: Node },
    NodeDeleted { node: Node },
}

impl ClusterEvent {
    /// Short label for logs and queue move reasons
    pub fn label(&self) -> &'static str {
        match self {
            Self::PodAdded { .. } => "PodAdded",
            Self::PodUpdated { .. } => "PodUpdated",
            Self::PodDeleted { .. } => "PodDeleted",
            Self::NodeAdded { .. } => "NodeAdded",
            Self::NodeUpdated { .. } => "NodeUpdated",
            Self::NodeDeleted { .. } => "NodeDeleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_event_serde_roundtrip() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("nginx".to_string());

        let event = ClusterEvent::PodAdded { pod };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"POD_ADDED\""));

        let back: ClusterEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.label(), "PodAdded");
    }
}
