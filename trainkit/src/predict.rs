//! Deploy-predict-teardown assertion for serving endpoints.
//!
//! [`Estimator`] and [`Predictor`] are the seams to whatever hosts the model
//! (the local-mode server in [`crate::local`], or a remote deployment in a
//! downstream crate). [`predict_and_assert_response_length`] drives one full
//! round trip under the local-mode lock and always tears the endpoint down.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::{CONTENT_TYPE_NPY, Deserializer, Rows, Serializer};
use crate::config::LockConfig;
use crate::error::PredictError;
use crate::lock::LocalModeLock;

/// A trained model that can be deployed behind an endpoint.
pub trait Estimator {
    /// Handle to a deployed endpoint.
    type Predictor: Predictor;

    /// Deploy `instance_count` instances of `instance_type`.
    ///
    /// # Errors
    /// Returns [`PredictError::Deploy`] if the endpoint cannot be brought up.
    fn deploy(
        &self,
        instance_count: u32,
        instance_type: &str,
    ) -> Result<Self::Predictor, PredictError>;
}

/// A deployed endpoint.
pub trait Predictor {
    /// Endpoint name, for logs and errors.
    fn endpoint_name(&self) -> &str;

    /// Content type of request bodies.
    fn set_content_type(&mut self, content_type: &str);

    /// Content type requested for response bodies.
    fn set_accept(&mut self, accept: &str);

    /// Request body encoder. `None` selects the built-in codec for the
    /// current content type.
    fn set_serializer(&mut self, serializer: Option<Arc<dyn Serializer>>);

    /// Response body decoder. `None` selects the built-in codec for the
    /// current accept type.
    fn set_deserializer(&mut self, deserializer: Option<Arc<dyn Deserializer>>);

    /// Send one prediction request.
    ///
    /// # Errors
    /// Returns an error if the request cannot be encoded, sent or decoded.
    fn predict(&mut self, data: &[Vec<f64>]) -> Result<Rows, PredictError>;

    /// Tear the endpoint down.
    ///
    /// # Errors
    /// Returns an error if teardown fails or the endpoint is already gone.
    fn delete_endpoint(&mut self) -> Result<(), PredictError>;
}

/// Endpoint format overrides for a prediction round trip.
#[derive(Clone)]
#[non_exhaustive]
pub struct PredictOptions {
    /// Content type for both the request and the accepted response
    /// (default: `application/x-npy`).
    pub content_type: String,
    /// Request encoder, used only when `content_type` is not the default.
    pub serializer: Option<Arc<dyn Serializer>>,
    /// Response decoder, used only when `content_type` is not the default.
    pub deserializer: Option<Arc<dyn Deserializer>>,
}

impl PredictOptions {
    /// Options for a non-default content type.
    #[must_use]
    pub fn with_content_type(
        content_type: impl Into<String>,
        serializer: Option<Arc<dyn Serializer>>,
        deserializer: Option<Arc<dyn Deserializer>>,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            serializer,
            deserializer,
        }
    }

    /// Whether the endpoint's format needs overriding.
    #[must_use]
    pub fn overrides_format(&self) -> bool {
        self.content_type != CONTENT_TYPE_NPY
    }
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            content_type: CONTENT_TYPE_NPY.to_owned(),
            serializer: None,
            deserializer: None,
        }
    }
}

impl fmt::Debug for PredictOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictOptions")
            .field("content_type", &self.content_type)
            .field(
                "serializer",
                &self.serializer.as_ref().map(|s| s.content_type()),
            )
            .field(
                "deserializer",
                &self.deserializer.as_ref().map(|d| d.accept()),
            )
            .finish()
    }
}

/// Deletes the endpoint exactly once: explicitly via [`EndpointGuard::teardown`],
/// or on drop if the round trip unwound before reaching it.
struct EndpointGuard<P: Predictor> {
    predictor: P,
    deleted: bool,
}

impl<P: Predictor> EndpointGuard<P> {
    fn new(predictor: P) -> Self {
        Self {
            predictor,
            deleted: false,
        }
    }

    fn teardown(&mut self) -> Result<(), PredictError> {
        if self.deleted {
            return Ok(());
        }
        self.deleted = true;
        info!(endpoint = self.predictor.endpoint_name(), "deleting endpoint");
        self.predictor.delete_endpoint()
    }
}

impl<P: Predictor> Drop for EndpointGuard<P> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(
                endpoint = self.predictor.endpoint_name(),
                error = %e,
                "endpoint teardown failed during unwind"
            );
        }
    }
}

/// Deploy one instance, predict once, and check the response length.
///
/// Runs entirely under the local-mode lock described by `lock`. When
/// `options` names a content type other than `application/x-npy`, the
/// endpoint's content type, accept type, serializer and deserializer are all
/// overridden before predicting. Returns the prediction on success.
///
/// The endpoint is deleted exactly once after a successful deploy, whatever
/// happens next (including a panic inside the predictor), and before the
/// lock's release delay starts.
///
/// # Errors
/// - [`PredictError::Lock`] if the lock cannot be taken.
/// - Any deploy or prediction error from the estimator/predictor.
/// - [`PredictError::LengthMismatch`] if result and input lengths differ.
/// - A teardown error, when nothing failed earlier. An earlier failure takes
///   precedence and the teardown error is only logged.
pub fn predict_and_assert_response_length<E: Estimator>(
    estimator: &E,
    data: &[Vec<f64>],
    instance_type: &str,
    options: &PredictOptions,
    lock: &LockConfig,
) -> Result<Rows, PredictError> {
    let _lock = LocalModeLock::new(lock.clone()).acquire()?;

    let predictor = estimator.deploy(1, instance_type)?;
    let mut endpoint = EndpointGuard::new(predictor);
    info!(
        endpoint = endpoint.predictor.endpoint_name(),
        instance_type, "endpoint deployed"
    );

    let outcome = predict_checked(&mut endpoint.predictor, data, options);
    let teardown = endpoint.teardown();

    match (outcome, teardown) {
        (Ok(rows), Ok(())) => Ok(rows),
        (Ok(_), Err(teardown_err)) => Err(teardown_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown_err)) => {
            warn!(error = %teardown_err, "endpoint teardown failed after prediction error");
            Err(e)
        }
    }
}

fn predict_checked<P: Predictor>(
    predictor: &mut P,
    data: &[Vec<f64>],
    options: &PredictOptions,
) -> Result<Rows, PredictError> {
    if options.overrides_format() {
        predictor.set_content_type(&options.content_type);
        predictor.set_serializer(options.serializer.clone());
        predictor.set_accept(&options.content_type);
        predictor.set_deserializer(options.deserializer.clone());
    }

    let response = predictor.predict(data)?;
    if response.len() != data.len() {
        return Err(PredictError::LengthMismatch {
            expected: data.len(),
            actual: response.len(),
        });
    }
    Ok(response)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unnecessary_literal_bound
)]
mod tests {
    use super::*;
    use crate::codec::{CONTENT_TYPE_CSV, CsvCodec};
    use std::fs::{File, TryLockError};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Behavior {
        Echo,
        DropOne,
        Fail,
        Panic,
    }

    struct MockState {
        deploys: AtomicUsize,
        deletes: AtomicUsize,
        calls: Mutex<Vec<String>>,
        lock_held_at_delete: Mutex<Option<bool>>,
        lock_path: PathBuf,
    }

    struct MockEstimator {
        behavior: Behavior,
        fail_delete: bool,
        state: Arc<MockState>,
    }

    struct MockPredictor {
        behavior: Behavior,
        fail_delete: bool,
        state: Arc<MockState>,
    }

    impl Estimator for MockEstimator {
        type Predictor = MockPredictor;

        fn deploy(
            &self,
            instance_count: u32,
            instance_type: &str,
        ) -> Result<MockPredictor, PredictError> {
            self.state.deploys.fetch_add(1, Ordering::SeqCst);
            self.state
                .calls
                .lock()
                .unwrap()
                .push(format!("deploy {instance_count} {instance_type}"));
            Ok(MockPredictor {
                behavior: self.behavior,
                fail_delete: self.fail_delete,
                state: Arc::clone(&self.state),
            })
        }
    }

    impl Predictor for MockPredictor {
        fn endpoint_name(&self) -> &str {
            "mock-endpoint"
        }

        fn set_content_type(&mut self, content_type: &str) {
            self.record(format!("content_type {content_type}"));
        }

        fn set_accept(&mut self, accept: &str) {
            self.record(format!("accept {accept}"));
        }

        fn set_serializer(&mut self, serializer: Option<Arc<dyn Serializer>>) {
            self.record(format!("serializer {}", serializer.is_some()));
        }

        fn set_deserializer(&mut self, deserializer: Option<Arc<dyn Deserializer>>) {
            self.record(format!("deserializer {}", deserializer.is_some()));
        }

        fn predict(&mut self, data: &[Vec<f64>]) -> Result<Rows, PredictError> {
            match self.behavior {
                Behavior::Echo => Ok(data.to_vec()),
                Behavior::DropOne => Ok(data.iter().skip(1).cloned().collect()),
                Behavior::Fail => Err(PredictError::Request {
                    endpoint: "mock-endpoint".to_owned(),
                    message: "connection refused".to_owned(),
                }),
                Behavior::Panic => panic!("model server crashed"),
            }
        }

        fn delete_endpoint(&mut self) -> Result<(), PredictError> {
            self.state.deletes.fetch_add(1, Ordering::SeqCst);
            let probe = File::options()
                .write(true)
                .open(&self.state.lock_path)
                .unwrap();
            let held = matches!(probe.try_lock(), Err(TryLockError::WouldBlock));
            *self.state.lock_held_at_delete.lock().unwrap() = Some(held);
            if self.fail_delete {
                return Err(PredictError::Teardown {
                    endpoint: "mock-endpoint".to_owned(),
                    message: "throttled".to_owned(),
                });
            }
            Ok(())
        }
    }

    impl MockPredictor {
        fn record(&self, call: String) {
            self.state.calls.lock().unwrap().push(call);
        }
    }

    fn fixture(behavior: Behavior, fail_delete: bool) -> (TempDir, LockConfig, MockEstimator) {
        let tmp = TempDir::new().unwrap();
        let lock = LockConfig::new(tmp.path().join("local_mode_lock"), Duration::ZERO);
        let state = Arc::new(MockState {
            deploys: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            lock_held_at_delete: Mutex::new(None),
            lock_path: lock.path.clone(),
        });
        let estimator = MockEstimator {
            behavior,
            fail_delete,
            state,
        };
        (tmp, lock, estimator)
    }

    fn data(n: usize) -> Rows {
        (0..n).map(|i| vec![f64::from(u32::try_from(i).unwrap()); 3]).collect()
    }

    #[test]
    fn test_matching_length_succeeds_and_deletes_once() {
        let (_tmp, lock, estimator) = fixture(Behavior::Echo, false);
        let rows = predict_and_assert_response_length(
            &estimator,
            &data(5),
            "local",
            &PredictOptions::default(),
            &lock,
        )
        .unwrap();

        assert_eq!(rows.len(), 5);
        assert_eq!(estimator.state.deploys.load(Ordering::SeqCst), 1);
        assert_eq!(estimator.state.deletes.load(Ordering::SeqCst), 1);
        let calls = estimator.state.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["deploy 1 local"]);
    }

    #[test]
    fn test_length_mismatch_still_deletes_once() {
        let (_tmp, lock, estimator) = fixture(Behavior::DropOne, false);
        let err = predict_and_assert_response_length(
            &estimator,
            &data(4),
            "local",
            &PredictOptions::default(),
            &lock,
        )
        .unwrap_err();

        assert!(
            matches!(
                err,
                PredictError::LengthMismatch {
                    expected: 4,
                    actual: 3
                }
            ),
            "got: {err:?}"
        );
        assert_eq!(estimator.state.deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prediction_error_wins_over_teardown_error() {
        let (_tmp, lock, estimator) = fixture(Behavior::Fail, true);
        let err = predict_and_assert_response_length(
            &estimator,
            &data(2),
            "local",
            &PredictOptions::default(),
            &lock,
        )
        .unwrap_err();

        assert!(matches!(err, PredictError::Request { .. }), "got: {err:?}");
        assert_eq!(estimator.state.deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_error_surfaces_after_success() {
        let (_tmp, lock, estimator) = fixture(Behavior::Echo, true);
        let err = predict_and_assert_response_length(
            &estimator,
            &data(2),
            "local",
            &PredictOptions::default(),
            &lock,
        )
        .unwrap_err();

        assert!(matches!(err, PredictError::Teardown { .. }), "got: {err:?}");
    }

    #[test]
    fn test_panic_in_predictor_still_deletes_once() {
        let (_tmp, lock, estimator) = fixture(Behavior::Panic, false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            predict_and_assert_response_length(
                &estimator,
                &data(2),
                "local",
                &PredictOptions::default(),
                &lock,
            )
        }));

        assert!(result.is_err());
        assert_eq!(estimator.state.deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_endpoint_deleted_while_lock_is_held() {
        let (_tmp, lock, estimator) = fixture(Behavior::Echo, false);
        predict_and_assert_response_length(
            &estimator,
            &data(1),
            "local",
            &PredictOptions::default(),
            &lock,
        )
        .unwrap();

        assert_eq!(*estimator.state.lock_held_at_delete.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_non_default_content_type_overrides_format() {
        let (_tmp, lock, estimator) = fixture(Behavior::Echo, false);
        let options = PredictOptions::with_content_type(
            CONTENT_TYPE_CSV,
            Some(Arc::new(CsvCodec)),
            None,
        );
        predict_and_assert_response_length(&estimator, &data(3), "local_gpu", &options, &lock)
            .unwrap();

        let calls = estimator.state.calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            [
                "deploy 1 local_gpu",
                "content_type text/csv",
                "serializer true",
                "accept text/csv",
                "deserializer false",
            ]
        );
    }

    #[test]
    fn test_options_debug_lists_codecs() {
        let options = PredictOptions::with_content_type(
            CONTENT_TYPE_CSV,
            Some(Arc::new(CsvCodec)),
            Some(Arc::new(CsvCodec)),
        );
        let rendered = format!("{options:?}");
        assert!(rendered.contains("text/csv"), "got: {rendered}");
        assert!(!PredictOptions::default().overrides_format());
    }
}
