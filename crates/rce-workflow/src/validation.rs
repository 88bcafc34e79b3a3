//! Result of checking a workflow against the known network

use rce_types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Everything that keeps a workflow from being started, collected in one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Controller node that cannot host the workflow, if any
    pub missing_controller_node_id: Option<NodeId>,
    /// Component name to the node it cannot run on
    pub missing_components_node_ids: BTreeMap<String, NodeId>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.missing_controller_node_id.is_none() && self.missing_components_node_ids.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            return f.write_str("no problems");
        }
        let mut problems = Vec::new();
        if let Some(node) = &self.missing_controller_node_id {
            problems.push(format!("controller node {} is not available", node));
        }
        for (component, node) in &self.missing_components_node_ids {
            problems.push(format!("component '{}' is not available on {}", component, node));
        }
        f.write_str(&problems.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_all_problems() {
        let mut report = ValidationReport::default();
        assert!(report.is_valid());

        report.missing_controller_node_id = Some(NodeId::new("ctrl"));
        report
            .missing_components_node_ids
            .insert("Script".into(), NodeId::new("x"));
        let text = report.to_string();
        assert!(!report.is_valid());
        assert!(text.contains("controller node node:ctrl"));
        assert!(text.contains("'Script'"));
    }
}
