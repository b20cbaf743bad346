use kube::CustomResourceExt;
use machinepool_operator::resources::{awsmachinepools::AwsMachinePool, awsmachines::AwsMachine};

fn main() -> anyhow::Result<()> {
    for crd in [AwsMachinePool::crd(), AwsMachine::crd()] {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
