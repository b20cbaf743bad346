use std::collections::BTreeSet;

use tracing::*;

use crate::cloud::{Fleet, FleetGateway, FleetInstance};
use crate::controllers::awsmachinepool::client::PoolClient;
use crate::resources::awsmachinepools::AwsMachinePool;
use crate::{Error, Result};

const TERMINATED: &str = "terminated";

/// Makes the pool's AwsMachines mirror the fleet membership: one per live instance.
///
/// Every instance and every orphaned record is attempted; failures are reported together.
pub(crate) async fn sync_machines(
    gateway: &dyn FleetGateway,
    client: &dyn PoolClient,
    pool: &AwsMachinePool,
    fleet: &Fleet,
) -> Result<()> {
    let machines = client.list_machines(pool).await?;
    let mut errors = Vec::new();

    let tracked: BTreeSet<&str> = machines
        .iter()
        .map(|m| m.spec.instance_id.as_str())
        .collect();

    for instance in &fleet.instances {
        if tracked.contains(instance.id.as_str()) {
            continue;
        }

        let found = match gateway.instance_by_id(&instance.id).await {
            Ok(found) => found,
            Err(err) => {
                errors.push(Error::gateway("describe", format!("instance {}", instance.id))(err));
                continue;
            }
        };

        // instances can disappear between listing the fleet and looking them up
        let Some(found) = found.filter(|i| i.state.as_deref() != Some(TERMINATED)) else {
            debug!("Instance {} is gone, not tracking it", instance.id);
            continue;
        };

        let instance = FleetInstance {
            id: found.id,
            availability_zone: found.availability_zone,
            lifecycle_state: instance.lifecycle_state.clone(),
        };
        debug!("Creating AwsMachine for instance {}", instance.id);
        if let Err(err) = client.create_machine(pool, &instance).await {
            errors.push(err);
        }
    }

    let live: BTreeSet<&str> = fleet.instances.iter().map(|i| i.id.as_str()).collect();
    for machine in machines
        .iter()
        .filter(|m| !live.contains(m.spec.instance_id.as_str()))
    {
        debug!(
            "Deleting AwsMachine for instance {} which left the fleet",
            machine.spec.instance_id
        );
        if let Err(err) = client.delete_machine(machine).await {
            errors.push(err);
        }
    }

    Error::aggregate(errors)
}

/// Removes every AwsMachine of the pool, along with the Machines owning them.
pub(crate) async fn delete_all_machines(
    client: &dyn PoolClient,
    pool: &AwsMachinePool,
) -> Result<()> {
    let mut errors = Vec::new();
    for machine in client.list_machines(pool).await? {
        if let Err(err) = client.delete_machine(&machine).await {
            errors.push(err);
        }
    }
    Error::aggregate(errors)
}
