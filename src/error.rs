use thiserror::Error;

/// Typed error model for the retention engine.
///
/// A TTL that isn't due yet is deliberately not represented here: that's not
/// an error, it's a value (`ttl::TtlOutcome::Requeue`) — see `ttl.rs`.
#[derive(Debug, Error)]
pub enum PrunerError {
    /// Missing RBAC. Surfaced up; never silently retried.
    #[error("permission denied: {0}")]
    Forbidden(String),

    /// A transient API error (conflict, server timeout, rate limit). The caller
    /// re-enqueues; this is never logged at error severity.
    #[error("retryable cluster error: {0}")]
    Retryable(String),

    /// A non-retryable, non-RBAC cluster error that does not fit another kind.
    #[error("cluster error: {0}")]
    Kube(#[from] kube::Error),

    /// An annotation failed to parse (non-RFC3339 timestamp, non-integer limit).
    /// The disposition for this is to strip the offending annotation and continue;
    /// this variant just carries enough detail for that cleanup and for the metric.
    #[error("invalid annotation {annotation}: {raw:?}")]
    Validation { annotation: &'static str, raw: String },

    /// Malformed YAML in the configuration document. The previous Policy Store
    /// document is retained by the caller; this error only aborts the reload.
    #[error("failed to parse configuration document: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A panic was caught at the reconcile-call boundary.
    #[error("internal panic during reconciliation: {0}")]
    Panic(String),

    /// The operation was cancelled via a `CancellationToken` before completing.
    #[error("operation cancelled")]
    Cancelled,
}

impl PrunerError {
    /// Classify a raw `kube::Error` into one of the kinds above.
    ///
    /// Callers that can treat 404 as success (patch/delete) should check for
    /// that case themselves *before* calling this — by the time this runs, a 404
    /// is just another non-retryable error from this type's point of view.
    pub fn from_api_error(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 403 => PrunerError::Forbidden(resp.message.clone()),
            kube::Error::Api(resp)
                if matches!(resp.code, 409 | 423 | 429 | 500 | 502 | 503 | 504) =>
            {
                PrunerError::Retryable(resp.message.clone())
            }
            _ => PrunerError::Kube(err),
        }
    }

    /// True for error kinds the host should silently re-enqueue rather than
    /// log at error severity.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PrunerError::Retryable(_))
    }

    /// The metric reason string the reporter should use for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            PrunerError::Forbidden(_) => "permission_denied",
            PrunerError::Retryable(_) => "retryable",
            PrunerError::Kube(_) => "api_error",
            PrunerError::Validation { .. } => "validation_error",
            PrunerError::ConfigParse(_) => "config_parse_error",
            PrunerError::Panic(_) => "panic",
            PrunerError::Cancelled => "cancelled",
        }
    }
}

/// Returns `true` if `err` represents a Kubernetes 404 (Not Found).
///
/// A 404 on get/patch/delete is treated as success: the Run is already gone.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}
