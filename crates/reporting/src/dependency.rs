use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use rasp_core::types::AgentMetadata;
use policy_engine::event::now_millis;

/// One third-party component found in the monitored application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// Stable identity for upserts: the same component at the same paths
    /// reported by the same agent always maps to one record.
    pub upsert_id: String,
    pub path: Vec<String>,
    #[serde(rename = "@timestamp")]
    pub timestamp: i64,
    pub agent_id: String,
    pub hostname: String,
    pub app_id: String,
    pub vendor: String,
    pub product: String,
    pub version: String,
    /// `vendor:product:version`
    pub tag: String,
    pub search_string: String,
    pub source: String,
}

impl DependencyRecord {
    pub fn new(
        agent: &AgentMetadata,
        vendor: &str,
        product: &str,
        version: &str,
        path: Vec<String>,
        source: &str,
    ) -> Self {
        let tag = format!("{vendor}:{product}:{version}");
        let agent_id = agent.agent_id.to_string();
        let upsert_id = upsert_id(&path, &tag, &agent_id);
        Self {
            upsert_id,
            path,
            timestamp: now_millis(),
            agent_id,
            hostname: agent.host_name.clone(),
            app_id: agent.app_id.clone(),
            vendor: vendor.to_string(),
            product: product.to_string(),
            version: version.to_string(),
            search_string: format!("{product}{version}"),
            tag,
            source: source.to_string(),
        }
    }
}

fn upsert_id(path: &[String], tag: &str, agent_id: &str) -> String {
    let mut hasher = Sha256::new();
    for entry in path {
        hasher.update(entry.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([0x1e]);
    hasher.update(tag.as_bytes());
    hasher.update([0x1e]);
    hasher.update(agent_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Counts records per distinct `vendor:product:version` tag.
pub fn count_by_tag(records: &[DependencyRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.tag.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasp_core::ids::AgentId;

    fn agent() -> AgentMetadata {
        AgentMetadata {
            host_name: "web-1".to_string(),
            agent_id: AgentId::new(),
            app_id: "shop".to_string(),
        }
    }

    fn jar(agent: &AgentMetadata, version: &str, path: &str) -> DependencyRecord {
        DependencyRecord::new(
            agent,
            "apache",
            "commons-collections",
            version,
            vec![path.to_string()],
            "manifest",
        )
    }

    #[test]
    fn test_tag_and_search_string() {
        let record = jar(&agent(), "3.2.1", "/app/lib/cc.jar");
        assert_eq!(record.tag, "apache:commons-collections:3.2.1");
        assert_eq!(record.search_string, "commons-collections3.2.1");
        assert_eq!(record.hostname, "web-1");
    }

    #[test]
    fn test_upsert_id_identity() {
        let agent = agent();
        let a = jar(&agent, "3.2.1", "/app/lib/cc.jar");
        let b = jar(&agent, "3.2.1", "/app/lib/cc.jar");
        assert_eq!(a.upsert_id, b.upsert_id);

        assert_ne!(a.upsert_id, jar(&agent, "3.2.2", "/app/lib/cc.jar").upsert_id);
        assert_ne!(a.upsert_id, jar(&agent, "3.2.1", "/opt/cc.jar").upsert_id);
        assert_ne!(a.upsert_id, jar(&super::tests::agent(), "3.2.1", "/app/lib/cc.jar").upsert_id);
    }

    #[test]
    fn test_count_by_tag() {
        let agent = agent();
        let records = vec![
            jar(&agent, "3.2.1", "/a.jar"),
            jar(&agent, "3.2.1", "/b.jar"),
            jar(&agent, "4.0", "/c.jar"),
        ];
        let counts = count_by_tag(&records);
        assert_eq!(counts["apache:commons-collections:3.2.1"], 2);
        assert_eq!(counts["apache:commons-collections:4.0"], 1);
    }
}
