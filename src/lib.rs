use thiserror::Error;

use crate::cloud::GatewayError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to {action} {resource}: {source}")]
    Gateway {
        action: &'static str,
        resource: String,
        #[source]
        source: GatewayError,
    },

    #[error("Invalid AwsMachinePool spec: {0}")]
    InvalidSpec(String),

    #[error("The object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Gateway { .. } => "GatewayError",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::Multiple(_) => "Multiple",
        }
    }

    /// Terminal errors need a change to the declared object before another pass can succeed.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::InvalidSpec(_) => true,
            Error::Gateway { source, .. } => source.is_rejected(),
            _ => false,
        }
    }

    pub(crate) fn gateway(
        action: &'static str,
        resource: impl Into<String>,
    ) -> impl FnOnce(GatewayError) -> Error {
        let resource = resource.into();
        move |source| Error::Gateway {
            action,
            resource,
            source,
        }
    }

    /// Collapses a batch of sub-step failures into a single error, if there were any.
    pub(crate) fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

/// Cloud gateway contract and its HTTP implementation
pub mod cloud;

/// Condition bookkeeping for pool status
pub mod conditions;

pub mod controllers;

pub use controllers::{run, State};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// CRDs, owned and external
pub mod resources;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_keeps_every_failure() {
        let err = Error::aggregate(vec![
            Error::InvalidSpec("first".into()),
            Error::MissingObjectKey("namespace"),
        ])
        .unwrap_err();

        assert_eq!(err.metric_label(), "Multiple");
        assert_eq!(
            err.to_string(),
            "Invalid AwsMachinePool spec: first; The object is missing namespace"
        );
    }

    #[test]
    fn aggregate_of_nothing_is_ok() {
        assert!(Error::aggregate(vec![]).is_ok());
    }

    #[test]
    fn rejected_gateway_calls_are_terminal() {
        let err = Error::gateway("update", "fleet pool-a")(GatewayError::Rejected(
            "maxSize below minSize".into(),
        ));
        assert!(err.is_terminal());

        let err = Error::gateway("update", "fleet pool-a")(GatewayError::Transient(
            "connection reset".into(),
        ));
        assert!(!err.is_terminal());
        assert_eq!(
            err.to_string(),
            "failed to update fleet pool-a: transient gateway failure: connection reset"
        );
    }
}
