pub mod controller;

pub use controller::run;

mod backoff;
mod client;
mod reconciler;
mod reconcilers;
mod scope;

pub use client::{KubePoolClient, PoolClient};
pub use reconciler::{PoolReconciler, ReconcilerConfig};
pub use scope::ClusterScope;
