//! Error types for endpoint deployment and prediction.

use thiserror::Error;

use crate::codec::CodecError;
use crate::lock::LockError;

/// Failure while deploying, calling or tearing down an endpoint.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PredictError {
    /// The estimator could not bring up an endpoint.
    #[error("failed to deploy {instance_count} x {instance_type}: {message}")]
    Deploy {
        /// Requested instance count.
        instance_count: u32,
        /// Requested instance type.
        instance_type: String,
        /// Human-readable cause.
        message: String,
    },

    /// The prediction request did not complete.
    #[error("prediction request to {endpoint} failed: {message}")]
    Request {
        /// Endpoint name.
        endpoint: String,
        /// Human-readable cause.
        message: String,
    },

    /// The endpoint answered with a non-success status.
    #[error("endpoint {endpoint} returned HTTP {status}: {body}")]
    Status {
        /// Endpoint name.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
    },

    /// No serializer or deserializer is available for a content type.
    #[error("no codec available for content type {0:?}")]
    UnsupportedContentType(String),

    /// Request or response body could not be converted.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The endpoint was torn down before this call.
    #[error("endpoint {0} was already deleted")]
    AlreadyDeleted(String),

    /// Tearing the endpoint down failed.
    #[error("failed to delete endpoint {endpoint}: {message}")]
    Teardown {
        /// Endpoint name.
        endpoint: String,
        /// Human-readable cause.
        message: String,
    },

    /// The endpoint returned a different number of results than inputs sent.
    #[error("prediction returned {actual} results for {expected} inputs")]
    LengthMismatch {
        /// Number of input rows.
        expected: usize,
        /// Number of result rows.
        actual: usize,
    },

    /// The local-mode lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),
}
