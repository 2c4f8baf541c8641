//! Kubernetes Peer Discovery
//!
//! Finds sibling replicas through the pod API: the local pod is resolved
//! by hostname, its `app` label becomes the group selector, and ready pods
//! matching the selector are the peer set. Outside a cluster the peer set
//! is just the local replica and never changes.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::{Client, Config};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::discovery::{PeerDiscovery, PeerNotification};
use crate::error::{Error, Result};

const LABEL_KEY: &str = "app";
const POD_IP_COOLDOWN: Duration = Duration::from_secs(5);

/// Pod-API-backed discovery; falls back to a static single-replica view
/// when no in-cluster configuration is present.
pub struct KubeDiscovery {
    client: Option<Client>,
    namespace: String,
    selector: String,
    local_address: String,
}

impl KubeDiscovery {
    /// Detect the environment and resolve the local identity. In-cluster
    /// this blocks until the local pod has been assigned an IP.
    pub async fn new() -> Result<Self> {
        let config = match Config::incluster() {
            Ok(config) => config,
            Err(e) => {
                info!(reason = %e, "running out-of-cluster");
                return Ok(Self {
                    client: None,
                    namespace: String::new(),
                    selector: String::new(),
                    local_address: "127.0.0.1".to_string(),
                });
            }
        };

        info!("running in-cluster");
        let namespace = config.default_namespace.clone();
        let client = Client::try_from(config)?;

        let pod_name = std::env::var("HOSTNAME")
            .map_err(|_| Error::Internal("HOSTNAME is not set; cannot resolve local pod".into()))?;

        let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let (selector, local_address) = Self::resolve_local_pod(&pods, &pod_name).await?;

        info!(
            pod = %pod_name,
            namespace = %namespace,
            selector = %selector,
            address = %local_address,
            "resolved local pod"
        );

        Ok(Self {
            client: Some(client),
            namespace,
            selector,
            local_address,
        })
    }

    /// Fetch the local pod, derive the group selector from its `app` label
    /// and wait for its IP assignment.
    async fn resolve_local_pod(pods: &Api<Pod>, pod_name: &str) -> Result<(String, String)> {
        loop {
            let pod = pods.get(pod_name).await?;

            let label = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_KEY))
                .cloned()
                .ok_or_else(|| {
                    Error::Internal(format!("local pod '{pod_name}' has no '{LABEL_KEY}' label"))
                })?;
            let selector = format!("{LABEL_KEY}={label}");

            if let Some(ip) = pod_address(&pod) {
                return Ok((selector, ip));
            }

            info!(pod = %pod_name, "local pod has no IP yet, waiting");
            tokio::time::sleep(POD_IP_COOLDOWN).await;
        }
    }
}

/// Check the pod's Ready condition
pub(crate) fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// The pod's assigned IP, if any
pub(crate) fn pod_address(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.clone())
        .filter(|ip| !ip.is_empty())
}

/// Map a watched pod to a membership notification
pub(crate) fn pod_notification(pod: &Pod, added: bool) -> Option<PeerNotification> {
    let address = pod_address(pod)?;
    Some(PeerNotification { address, added })
}

#[async_trait]
impl PeerDiscovery for KubeDiscovery {
    fn local_address(&self) -> &str {
        &self.local_address
    }

    async fn list(&self) -> Result<Vec<String>> {
        let Some(client) = &self.client else {
            return Ok(vec![self.local_address.clone()]);
        };

        let pods: Api<Pod> = Api::namespaced(client.clone(), &self.namespace);
        let params = ListParams::default().labels(&self.selector);
        let list = pods.list(&params).await?;

        Ok(list
            .items
            .iter()
            .filter(|pod| pod_ready(pod))
            .filter_map(pod_address)
            .collect())
    }

    async fn watch(&self, out: mpsc::Sender<PeerNotification>) -> Result<()> {
        let Some(client) = &self.client else {
            // Out-of-cluster membership never changes; dropping `out`
            // closes the stream for the reader.
            return Ok(());
        };

        let pods: Api<Pod> = Api::namespaced(client.clone(), &self.namespace);
        let config = watcher::Config::default().labels(&self.selector);
        let mut stream = watcher(pods, config).boxed();

        while let Some(event) = stream.next().await {
            let event =
                event.map_err(|e| Error::Unavailable(format!("pod watch failed: {e}")))?;

            let notifications: Vec<PeerNotification> = match event {
                watcher::Event::Applied(pod) => {
                    let ready = pod_ready(&pod);
                    debug!(pod = ?pod.metadata.name, ready, "pod applied");
                    pod_notification(&pod, ready).into_iter().collect()
                }
                watcher::Event::Deleted(pod) => {
                    debug!(pod = ?pod.metadata.name, "pod deleted");
                    pod_notification(&pod, false).into_iter().collect()
                }
                watcher::Event::Restarted(pods) => {
                    debug!(count = pods.len(), "pod watch restarted");
                    pods.iter()
                        .filter_map(|pod| pod_notification(pod, pod_ready(pod)))
                        .collect()
                }
            };

            for notification in notifications {
                if out.send(notification).await.is_err() {
                    warn!("peer notification receiver dropped, stopping watch");
                    return Ok(());
                }
            }
        }

        Err(Error::Unavailable("pod watch stream ended".to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;

    fn pod(name: &str, ip: Option<&str>, ready: Option<bool>) -> Pod {
        let conditions = ready.map(|ready| {
            vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]
        });

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: ip.map(String::from),
                conditions,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_ready_requires_true_condition() {
        assert!(pod_ready(&pod("p", Some("10.0.0.1"), Some(true))));
        assert!(!pod_ready(&pod("p", Some("10.0.0.1"), Some(false))));
        assert!(!pod_ready(&pod("p", Some("10.0.0.1"), None)));
    }

    #[test]
    fn test_pod_without_status_is_not_ready() {
        let bare = Pod::default();
        assert!(!pod_ready(&bare));
        assert_eq!(pod_address(&bare), None);
    }

    #[test]
    fn test_pod_notification_carries_readiness() {
        let p = pod("p", Some("10.0.0.7"), Some(true));

        let added = pod_notification(&p, true).unwrap();
        assert_eq!(added.address, "10.0.0.7");
        assert!(added.added);

        let removed = pod_notification(&p, false).unwrap();
        assert!(!removed.added);
    }

    #[test]
    fn test_pod_without_ip_yields_no_notification() {
        let p = pod("p", None, Some(true));
        assert!(pod_notification(&p, true).is_none());

        let empty_ip = pod("p", Some(""), Some(true));
        assert!(pod_notification(&empty_ip, true).is_none());
    }
}
