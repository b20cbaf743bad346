use std::collections::{BTreeMap, BTreeSet};

use tracing::*;

use crate::cloud::{FleetGateway, TaggedResource};
use crate::controllers::awsmachinepool::client::PoolClient;
use crate::resources::awsmachinepools::AwsMachinePool;
use crate::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct TagChanges {
    pub create: BTreeMap<String, String>,
    pub remove: BTreeSet<String>,
}

impl TagChanges {
    /// Tags to (re)create are those new or changed since `last_applied`; tags to remove are
    /// those applied before and no longer desired.
    pub fn between(
        last_applied: &BTreeMap<String, String>,
        desired: &BTreeMap<String, String>,
    ) -> Self {
        let create = desired
            .iter()
            .filter(|(k, v)| last_applied.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let remove = last_applied
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();

        Self { create, remove }
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.remove.is_empty()
    }
}

/// Pushes changed additional tags onto every resource, then records them on the pool.
pub(crate) async fn reconcile_tags(
    gateway: &dyn FleetGateway,
    client: &dyn PoolClient,
    pool: &AwsMachinePool,
    desired: &BTreeMap<String, String>,
    resources: &[TaggedResource],
) -> Result<()> {
    let changes = TagChanges::between(&pool.last_applied_tags()?, desired);
    if changes.is_empty() {
        return Ok(());
    }

    for resource in resources {
        debug!(
            "Updating tags of {resource}: {} to create, {} to remove",
            changes.create.len(),
            changes.remove.len()
        );
        gateway
            .update_resource_tags(resource, &changes.create, &changes.remove)
            .await
            .map_err(Error::gateway("update tags of", resource.to_string()))?;
    }

    client.set_last_applied_tags(pool, desired).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn changes_between_applied_and_desired() {
        let changes = TagChanges::between(
            &tags(&[("team", "infra"), ("cost-center", "42"), ("env", "prod")]),
            &tags(&[("team", "platform"), ("env", "prod"), ("owner", "sre")]),
        );

        assert_eq!(changes.create, tags(&[("team", "platform"), ("owner", "sre")]));
        assert_eq!(changes.remove, BTreeSet::from(["cost-center".to_string()]));
    }

    #[test]
    fn unchanged_tags_need_no_calls() {
        let applied = tags(&[("team", "infra")]);
        assert!(TagChanges::between(&applied, &applied.clone()).is_empty());
        assert!(TagChanges::between(&BTreeMap::new(), &BTreeMap::new()).is_empty());
    }
}
