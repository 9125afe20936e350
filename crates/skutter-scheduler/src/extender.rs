//! Out-of-process scoring extenders.
//!
//! An extender receives the pod and the names of the feasible nodes and
//! answers with a score in `[0, MAX_EXTENDER_PRIORITY]` per node. Scores are
//! rescaled and weighted by the decision engine.

use crate::config::ExtenderConfig;
use crate::engine::ExtenderScores;
use crate::types::{NodeInfo, MAX_EXTENDER_PRIORITY};
use crate::{Result, SchedulerError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait Extender: Send + Sync {
    fn name(&self) -> &str;

    fn weight(&self) -> u32;

    /// Whether a failure of this extender should be skipped rather than
    /// failing the cycle
    fn is_ignorable(&self) -> bool;

    /// Score the given nodes for `pod`
    async fn prioritize(&self, pod: &Pod, nodes: &[String]) -> Result<HashMap<String, i64>>;
}

/// Request body of the `prioritize` verb
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExtenderArgs<'a> {
    pod: &'a Pod,
    node_names: &'a [String],
}

/// One entry of the `prioritize` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

/// Extender reached over HTTP with JSON bodies
pub struct HttpExtender {
    name: String,
    url: String,
    weight: u32,
    ignorable: bool,
    client: Client,
}

impl HttpExtender {
    pub fn new(config: &ExtenderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                SchedulerError::invalid_config(
                    format!("cannot build HTTP client for extender {}: {}", config.name, e),
                    "Check the extender timeout",
                )
            })?;

        Ok(Self {
            name: config.name.clone(),
            url: format!("{}/prioritize", config.url.trim_end_matches('/')),
            weight: config.weight,
            ignorable: config.ignorable,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn failed(&self, message: impl Into<String>) -> SchedulerError {
        SchedulerError::ExtenderFailed {
            extender: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Extender for HttpExtender {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn is_ignorable(&self) -> bool {
        self.ignorable
    }

    async fn prioritize(&self, pod: &Pod, nodes: &[String]) -> Result<HashMap<String, i64>> {
        debug!("POST {}", self.url);

        let resp = self
            .client
            .post(&self.url)
            .json(&ExtenderArgs {
                pod,
                node_names: nodes,
            })
            .send()
            .await
            .map_err(|e| self.failed(format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.failed(format!(
                "prioritize failed with status {}: {}",
                status, body
            )));
        }

        let priorities = resp
            .json::<Vec<HostPriority>>()
            .await
            .map_err(|e| self.failed(format!("Failed to parse priorities: {}", e)))?;

        Ok(priorities.into_iter().map(|p| (p.host, p.score)).collect())
    }
}

/// Build the configured HTTP extenders
pub fn from_config(configs: &[ExtenderConfig]) -> Result<Vec<Arc<dyn Extender>>> {
    configs
        .iter()
        .map(|c| HttpExtender::new(c).map(|e| Arc::new(e) as Arc<dyn Extender>))
        .collect()
}

/// Query every extender for the feasible nodes.
///
/// A failing ignorable extender is skipped; any other failure, including a
/// score outside `[0, MAX_EXTENDER_PRIORITY]`, fails the cycle.
pub async fn run_extenders(
    extenders: &[Arc<dyn Extender>],
    pod: &Pod,
    nodes: &[NodeInfo],
) -> Result<Vec<ExtenderScores>> {
    if extenders.is_empty() {
        return Ok(Vec::new());
    }

    let names: Vec<String> = nodes.iter().map(|n| n.name().to_string()).collect();
    let mut columns = Vec::with_capacity(extenders.len());

    for extender in extenders {
        let result = extender.prioritize(pod, &names).await.and_then(|scores| {
            let invalid = scores
                .iter()
                .find(|(_, s)| !(0..=MAX_EXTENDER_PRIORITY).contains(*s))
                .map(|(host, score)| (host.clone(), *score));
            if let Some((host, score)) = invalid {
                return Err(SchedulerError::ExtenderFailed {
                    extender: extender.name().to_string(),
                    message: format!(
                        "score {} for node {} outside [0, {}]",
                        score, host, MAX_EXTENDER_PRIORITY
                    ),
                });
            }
            Ok(scores)
        });

        match result {
            Ok(scores) => columns.push(ExtenderScores {
                extender: extender.name().to_string(),
                weight: extender.weight(),
                scores,
            }),
            Err(e) if extender.is_ignorable() => {
                warn!("Skipping ignorable extender {}: {}", extender.name(), e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{create_test_node, create_test_pod};
    use std::time::Duration;

    struct MockExtender {
        name: &'static str,
        ignorable: bool,
        response: std::result::Result<Vec<(&'static str, i64)>, &'static str>,
    }

    #[async_trait]
    impl Extender for MockExtender {
        fn name(&self) -> &str {
            self.name
        }

        fn weight(&self) -> u32 {
            1
        }

        fn is_ignorable(&self) -> bool {
            self.ignorable
        }

        async fn prioritize(&self, _pod: &Pod, _nodes: &[String]) -> Result<HashMap<String, i64>> {
            match &self.response {
                Ok(scores) => Ok(scores.iter().map(|(h, s)| (h.to_string(), *s)).collect()),
                Err(message) => Err(SchedulerError::ExtenderFailed {
                    extender: self.name.to_string(),
                    message: message.to_string(),
                }),
            }
        }
    }

    fn nodes() -> Vec<NodeInfo> {
        vec![NodeInfo::new(create_test_node("node1", "4", "8Gi"))]
    }

    #[tokio::test]
    async fn test_ignorable_failure_is_skipped() {
        let extenders: Vec<Arc<dyn Extender>> = vec![
            Arc::new(MockExtender {
                name: "flaky",
                ignorable: true,
                response: Err("connection refused"),
            }),
            Arc::new(MockExtender {
                name: "gpu",
                ignorable: false,
                response: Ok(vec![("node1", 7)]),
            }),
        ];

        let columns = run_extenders(&extenders, &create_test_pod("p", "1", "1Gi"), &nodes())
            .await
            .unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].extender, "gpu");
        assert_eq!(columns[0].scores.get("node1"), Some(&7));
    }

    #[tokio::test]
    async fn test_required_failure_fails_cycle() {
        let extenders: Vec<Arc<dyn Extender>> = vec![Arc::new(MockExtender {
            name: "gpu",
            ignorable: false,
            response: Err("timeout"),
        })];

        let err = run_extenders(&extenders, &create_test_pod("p", "1", "1Gi"), &nodes())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ExtenderFailed { .. }));
    }

    #[tokio::test]
    async fn test_out_of_range_priority_is_a_failure() {
        let extenders: Vec<Arc<dyn Extender>> = vec![Arc::new(MockExtender {
            name: "gpu",
            ignorable: false,
            response: Ok(vec![("node1", 11)]),
        })];

        let err = run_extenders(&extenders, &create_test_pod("p", "1", "1Gi"), &nodes())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside [0, 10]"));
    }

    #[test]
    fn test_http_extender_config() {
        let extender = HttpExtender::new(&ExtenderConfig {
            name: "gpu".to_string(),
            url: "http://127.0.0.1:8888/scheduler/".to_string(),
            weight: 3,
            timeout: Duration::from_secs(1),
            ignorable: false,
        })
        .unwrap();

        assert_eq!(extender.url(), "http://127.0.0.1:8888/scheduler/prioritize");
        assert_eq!(extender.weight(), 3);
    }

    #[test]
    fn test_wire_format() {
        let pod = create_test_pod("p", "1", "1Gi");
        let names = vec!["node1".to_string()];
        let body = serde_json::to_value(ExtenderArgs {
            pod: &pod,
            node_names: &names,
        })
        .unwrap();
        assert_eq!(body["NodeNames"][0], "node1");
        assert_eq!(body["Pod"]["metadata"]["name"], "p");

        let parsed: Vec<HostPriority> =
            serde_json::from_str(r#"[{"Host":"node1","Score":4}]"#).unwrap();
        assert_eq!(parsed[0].host, "node1");
        assert_eq!(parsed[0].score, 4);
    }
}
