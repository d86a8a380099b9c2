//! HTTP façade emulating the 2014-11-13 Lambda invoke API.

use crate::error::InvokeError;
use crate::runtime::Dispatcher;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// API version prefix of every emulated route.
pub const API_PREFIX: &str = "/2014-11-13/";

/// Header carrying the invocation id of an accepted invocation.
pub const REQUEST_ID_HEADER: &str = "x-amzn-requestid";

/// Largest accepted request body.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// HTTP server in front of a [`Dispatcher`].
pub struct ApiServer {
    dispatcher: Dispatcher,
}

impl ApiServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = self.dispatcher.config().bind_addr().parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown`
    /// resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("HTTP server stopped");
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let dispatcher = self.dispatcher.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { handle_request(req, dispatcher, remote_addr).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    dispatcher: Dispatcher,
    remote_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("Handling request: {} {} from {}", method, path, remote_addr);

    let body = match read_body(req.into_body()).await {
        Ok(body) => body,
        Err(status) => return Ok(status_response(status)),
    };
    Ok(route(&dispatcher, &method, &path, body).await)
}

/// Buffer a request body, refusing it as soon as it grows past
/// [`MAX_BODY_SIZE`].
async fn read_body<B>(body: B) -> Result<Bytes, StatusCode>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_SIZE).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            warn!("Rejecting request body larger than {} bytes", MAX_BODY_SIZE);
            Err(StatusCode::PAYLOAD_TOO_LARGE)
        }
        Err(err) => {
            warn!(error = %err, "Failed to read request body");
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

/// Route one request.
pub async fn route(dispatcher: &Dispatcher, method: &Method, path: &str, body: Bytes) -> Response<Full<Bytes>> {
    if path == "/_health" {
        return text_response(StatusCode::OK, "OK");
    }
    if path == "/_stats" {
        return json_response(StatusCode::OK, &json!(dispatcher.stats()));
    }

    let Some(rest) = path.strip_prefix(API_PREFIX) else {
        return json_response(StatusCode::NOT_FOUND, &json!({ "Message": "Not found" }));
    };
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["functions", name, "invoke-async"] if *method == Method::POST => {
            invoke_async(dispatcher, name, body).await
        }
        ["functions"] if *method == Method::GET => list_functions(dispatcher),
        _ => json_response(StatusCode::NOT_IMPLEMENTED, &json!({})),
    }
}

async fn invoke_async(dispatcher: &Dispatcher, name: &str, body: Bytes) -> Response<Full<Bytes>> {
    if body.len() > MAX_BODY_SIZE {
        return status_response(StatusCode::PAYLOAD_TOO_LARGE);
    }
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(function = %name, error = %err, "Rejecting invalid JSON payload");
                return status_response(StatusCode::BAD_REQUEST);
            }
        }
    };

    let mut invocation = match dispatcher.invoke(name, payload) {
        Ok(invocation) => invocation,
        Err(err) => return status_response(error_status(&err)),
    };

    match invocation.accepted().await {
        Ok(id) => {
            let mut response = status_response(StatusCode::ACCEPTED);
            if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            response
        }
        Err(err) => status_response(error_status(&err)),
    }
}

fn list_functions(dispatcher: &Dispatcher) -> Response<Full<Bytes>> {
    let functions: Vec<Value> = dispatcher
        .list_functions()
        .into_iter()
        .map(|function| json!({ "FunctionName": function.name }))
        .collect();
    json_response(StatusCode::OK, &json!({ "Functions": functions }))
}

/// HTTP status for an invocation that could not be accepted.
pub fn error_status(err: &InvokeError) -> StatusCode {
    match err {
        InvokeError::FunctionNotFound(_) => StatusCode::NOT_FOUND,
        InvokeError::Draining => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "Status": status.as_u16() }))
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
