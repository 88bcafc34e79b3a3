//! Locally cached knowledge about the network

use async_trait::async_trait;
use rce_notification::SubscriptionTargets;
use rce_types::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// What this node currently knows about reachable nodes and their components
pub trait TopologyView: Send + Sync {
    fn local_node(&self) -> &NodeId;

    fn is_reachable(&self, node: &NodeId) -> bool;

    /// Reachable nodes able to host workflow controllers, local node included
    fn workflow_host_nodes(&self) -> Vec<NodeId>;

    fn is_workflow_host(&self, node: &NodeId) -> bool;

    fn has_component(&self, node: &NodeId, component_id: &str, version: &str) -> bool;
}

#[derive(Debug, Default, Clone)]
struct NodeInfo {
    workflow_host: bool,
    components: HashSet<(String, String)>,
}

/// Topology maintained by hand, e.g. from configuration or tests
#[derive(Debug)]
pub struct StaticTopology {
    local: NodeId,
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
}

impl StaticTopology {
    /// Topology containing only the local node, which is a workflow host
    pub fn new(local: NodeId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            local.clone(),
            NodeInfo {
                workflow_host: true,
                components: HashSet::new(),
            },
        );
        Self {
            local,
            nodes: RwLock::new(nodes),
        }
    }

    pub fn add_node(&self, node: NodeId, workflow_host: bool) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.entry(node).or_default().workflow_host = workflow_host;
        }
    }

    pub fn remove_node(&self, node: &NodeId) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.remove(node);
        }
    }

    pub fn install_component(
        &self,
        node: &NodeId,
        component_id: impl Into<String>,
        version: impl Into<String>,
    ) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes
                .entry(node.clone())
                .or_default()
                .components
                .insert((component_id.into(), version.into()));
        }
    }
}

impl TopologyView for StaticTopology {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    fn is_reachable(&self, node: &NodeId) -> bool {
        self.nodes.read().map(|n| n.contains_key(node)).unwrap_or(false)
    }

    fn workflow_host_nodes(&self) -> Vec<NodeId> {
        let Ok(nodes) = self.nodes.read() else {
            return vec![self.local.clone()];
        };
        let mut hosts: Vec<_> = nodes
            .iter()
            .filter(|(_, info)| info.workflow_host)
            .map(|(id, _)| id.clone())
            .collect();
        hosts.sort();
        hosts
    }

    fn is_workflow_host(&self, node: &NodeId) -> bool {
        self.nodes
            .read()
            .map(|n| n.get(node).map_or(false, |i| i.workflow_host))
            .unwrap_or(false)
    }

    fn has_component(&self, node: &NodeId, component_id: &str, version: &str) -> bool {
        self.nodes
            .read()
            .map(|n| {
                n.get(node).map_or(false, |i| {
                    i.components
                        .contains(&(component_id.to_string(), version.to_string()))
                })
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl SubscriptionTargets for StaticTopology {
    async fn workflow_host_nodes(&self) -> Vec<NodeId> {
        TopologyView::workflow_host_nodes(self)
    }
}
