use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("tunnel {0} has no service reference")]
    NoServiceRef(String),

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("There are no ports set on this LoadBalancer")]
    NoPortsSet,

    #[error("secret {0} has no token value")]
    EmptyAuthToken(String),

    #[error("The operator has encountered an error: {0}")]
    OperatorError(#[from] color_eyre::Report),
}

impl ReconcileError {
    /// Permanent failures are logged and dropped rather than requeued; the
    /// resource stays stalled until its spec is corrected, which re-triggers
    /// a watch event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::NoServiceRef(_)
                | ReconcileError::UnsupportedProvider(_)
                | ReconcileError::NoPortsSet
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_errors_are_fatal() {
        assert!(ReconcileError::NoServiceRef("web-tunnel".into()).is_fatal());
        assert!(ReconcileError::UnsupportedProvider("gce".into()).is_fatal());
        assert!(!ReconcileError::EmptyAuthToken("web-tunnel".into()).is_fatal());
    }
}
