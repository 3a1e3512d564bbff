//! Locally-hosted serving endpoints.
//!
//! [`LocalEstimator`] stands in for a serving container running on the test
//! machine: `deploy` binds the configured host and port, then serves `/ping`
//! and `/invocations` from a background thread. Every local endpoint binds the
//! same port, so only one can exist at a time; tests coordinate through
//! [`crate::lock`].

use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{
    CONTENT_TYPE_NPY, Deserializer, Rows, Serializer, deserializer_for, essence, serializer_for,
};
use crate::config::LocalModeConfig;
use crate::error::PredictError;
use crate::predict::{Estimator, Predictor};

/// Instance types accepted by [`LocalEstimator::deploy`].
pub const LOCAL_INSTANCE_TYPES: &[&str] = &["local", "local_gpu"];

/// Per-row inference function served by a local endpoint.
pub type Model = Arc<dyn Fn(&[f64]) -> Vec<f64> + Send + Sync>;

/// A model served from the local machine.
#[derive(Clone)]
pub struct LocalEstimator {
    model: Model,
    config: LocalModeConfig,
}

impl LocalEstimator {
    /// Serve `model` on the host and port in `config`.
    #[must_use]
    pub fn new<F>(model: F, config: LocalModeConfig) -> Self
    where
        F: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        Self {
            model: Arc::new(model),
            config,
        }
    }

    /// Bind configuration.
    #[must_use]
    pub fn config(&self) -> &LocalModeConfig {
        &self.config
    }
}

impl Estimator for LocalEstimator {
    type Predictor = LocalPredictor;

    fn deploy(
        &self,
        instance_count: u32,
        instance_type: &str,
    ) -> Result<LocalPredictor, PredictError> {
        let deploy_err = |message: String| PredictError::Deploy {
            instance_count,
            instance_type: instance_type.to_owned(),
            message,
        };

        if instance_count != 1 {
            return Err(deploy_err("local mode serves exactly one instance".to_owned()));
        }
        if !LOCAL_INSTANCE_TYPES.contains(&instance_type) {
            return Err(deploy_err(format!(
                "unsupported instance type, expected one of {LOCAL_INSTANCE_TYPES:?}"
            )));
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        // Bind before returning so a busy port is a deploy error and requests
        // sent right after deploy queue on the socket instead of failing.
        let listener = TcpListener::bind(&addr)
            .map_err(|e| deploy_err(format!("cannot bind {addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| deploy_err(e.to_string()))?;

        let endpoint_name = format!("trainkit-local-{}", Uuid::new_v4());
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| deploy_err(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = Arc::new(ServingState {
            model: Arc::clone(&self.model),
        });
        let thread = std::thread::Builder::new()
            .name(endpoint_name.clone())
            .spawn(move || serve(listener, state, shutdown_rx))
            .map_err(|e| deploy_err(e.to_string()))?;

        info!(endpoint = %endpoint_name, %addr, instance_type, "local endpoint started");

        Ok(LocalPredictor {
            invocations_url: format!("{}/invocations", self.config.base_url()),
            endpoint_name,
            content_type: CONTENT_TYPE_NPY.to_owned(),
            accept: CONTENT_TYPE_NPY.to_owned(),
            serializer: None,
            deserializer: None,
            client: Some(client),
            server: Some(ServerHandle {
                shutdown: shutdown_tx,
                thread,
            }),
        })
    }
}

struct ServingState {
    model: Model,
}

fn serve(
    listener: TcpListener,
    state: Arc<ServingState>,
    shutdown: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async {
                let _ = shutdown.await;
            })
            .await
    })
}

fn router(state: Arc<ServingState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations))
        .with_state(state)
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

async fn invocations(
    State(state): State<Arc<ServingState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = header_str(&headers, header::CONTENT_TYPE).unwrap_or(CONTENT_TYPE_NPY);
    let accept = header_str(&headers, header::ACCEPT)
        .filter(|accept| essence(accept) != "*/*")
        .unwrap_or(content_type);

    let Some(deserializer) = deserializer_for(content_type) else {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("unsupported content type {content_type}"),
        )
            .into_response();
    };
    let Some(serializer) = serializer_for(accept) else {
        return (
            StatusCode::NOT_ACCEPTABLE,
            format!("unsupported accept type {accept}"),
        )
            .into_response();
    };

    let rows = match deserializer.deserialize(&body) {
        Ok(rows) => rows,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    debug!(rows = rows.len(), content_type, accept, "invocation");

    let predictions: Rows = rows.iter().map(|row| (state.model)(row.as_slice())).collect();
    match serializer.serialize(&predictions) {
        Ok(bytes) => ([(header::CONTENT_TYPE, serializer.content_type())], bytes).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Signal graceful shutdown and wait until the listening socket is closed.
    fn stop(self) -> Result<(), String> {
        // The receiver is gone only if the server already exited; join reports why.
        let _ = self.shutdown.send(());
        match self.thread.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("server thread panicked".to_owned()),
        }
    }
}

/// Client handle to a local endpoint. Dropping it stops the server.
pub struct LocalPredictor {
    endpoint_name: String,
    invocations_url: String,
    content_type: String,
    accept: String,
    serializer: Option<Arc<dyn Serializer>>,
    deserializer: Option<Arc<dyn Deserializer>>,
    client: Option<reqwest::blocking::Client>,
    server: Option<ServerHandle>,
}

impl LocalPredictor {
    /// Whether the endpoint is still being served.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    fn request_err(&self, error: &reqwest::Error) -> PredictError {
        PredictError::Request {
            endpoint: self.endpoint_name.clone(),
            message: error.to_string(),
        }
    }
}

impl Predictor for LocalPredictor {
    fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    fn set_content_type(&mut self, content_type: &str) {
        content_type.clone_into(&mut self.content_type);
    }

    fn set_accept(&mut self, accept: &str) {
        accept.clone_into(&mut self.accept);
    }

    fn set_serializer(&mut self, serializer: Option<Arc<dyn Serializer>>) {
        self.serializer = serializer;
    }

    fn set_deserializer(&mut self, deserializer: Option<Arc<dyn Deserializer>>) {
        self.deserializer = deserializer;
    }

    fn predict(&mut self, data: &[Vec<f64>]) -> Result<Rows, PredictError> {
        let (Some(client), true) = (self.client.as_ref(), self.server.is_some()) else {
            return Err(PredictError::AlreadyDeleted(self.endpoint_name.clone()));
        };

        let serializer = self
            .serializer
            .clone()
            .or_else(|| serializer_for(&self.content_type))
            .ok_or_else(|| PredictError::UnsupportedContentType(self.content_type.clone()))?;
        let deserializer = self
            .deserializer
            .clone()
            .or_else(|| deserializer_for(&self.accept))
            .ok_or_else(|| PredictError::UnsupportedContentType(self.accept.clone()))?;

        let body = serializer.serialize(data)?;
        let response = client
            .post(&self.invocations_url)
            .header(reqwest::header::CONTENT_TYPE, &self.content_type)
            .header(reqwest::header::ACCEPT, &self.accept)
            .body(body)
            .send()
            .map_err(|e| self.request_err(&e))?;

        let status = response.status();
        let bytes = response.bytes().map_err(|e| self.request_err(&e))?;
        if !status.is_success() {
            return Err(PredictError::Status {
                endpoint: self.endpoint_name.clone(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(deserializer.deserialize(&bytes)?)
    }

    fn delete_endpoint(&mut self) -> Result<(), PredictError> {
        let Some(server) = self.server.take() else {
            return Err(PredictError::AlreadyDeleted(self.endpoint_name.clone()));
        };
        // Drop pooled keep-alive connections before the server drains.
        self.client = None;
        server.stop().map_err(|message| PredictError::Teardown {
            endpoint: self.endpoint_name.clone(),
            message,
        })?;
        info!(endpoint = %self.endpoint_name, "local endpoint stopped");
        Ok(())
    }
}

impl Drop for LocalPredictor {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            self.client = None;
            if let Err(e) = server.stop() {
                warn!(endpoint = %self.endpoint_name, error = %e, "local endpoint did not stop cleanly");
            }
        }
    }
}
