use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (i.e. us)
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }

    /// True for optimistic-concurrency failures on writes, including ones
    /// surfaced through the finalizer wrapper. The object changed between the
    /// read and the write, so the caller should requeue promptly and retry
    /// from a fresh read.
    pub fn is_conflict(&self) -> bool {
        use kube::runtime::finalizer;
        match self {
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            Error::FinalizerError(fe) => match fe.as_ref() {
                finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => {
                    e.is_conflict()
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;
