pub mod awsmachinepools;
pub mod awsmachines;

/// Cluster API types this operator reads but does not own
pub mod capi;
