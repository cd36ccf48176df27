//! JSON-RPC 2.0 over a [Connection], in both roles at once.
//!
//! As a server the engine dispatches incoming requests to methods added with
//! [JsonRpc::add_method]. As a client it sends requests with
//! [JsonRpc::request] and resolves the returned [Job] when the matching
//! response arrives. Both directions share one connection and one read loop,
//! [JsonRpc::run].
//!
//! Requests are handled on the read loop, one at a time and in arrival
//! order. Methods doing long work should return a [Job] rather than block:
//! the engine replies when that job concludes, and forwards each of its
//! heartbeats to the caller as a [HEARTBEAT_METHOD] notification carrying
//! the request id.

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use jsonrpc::{ErrorCode, ErrorObject, JsonReader, Message, Request, Response};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    connection::{Connection, ConnectionError},
    job::{Conclusion, Job, JobEvent},
};

/// Notification relaying a heartbeat of a job-backed request, with params
/// `{"id": <request id>, "progress": <heartbeat payload>}`.
pub const HEARTBEAT_METHOD: &str = "job.heartbeat";

#[derive(Debug, Deserialize)]
struct HeartbeatParams {
    id: u64,
    #[serde(default)]
    progress: Value,
}

/// What a [RawHandler] did with the bytes it was fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFeed {
    /// Everything was consumed and more is needed.
    Pending,
    /// Finished after the first `consumed` bytes. The rest goes back to
    /// JSON framing.
    Done {
        /// Bytes of the last feed that belonged to the sub-protocol.
        consumed: usize,
    },
}

/// Consumer of a non-JSON sub-protocol that temporarily owns the stream.
pub trait RawHandler: Send {
    /// Take the next bytes off the wire.
    fn feed(&mut self, data: &[u8]) -> RawFeed;
}

/// What a method hands back to the engine.
pub enum Reply {
    /// Reply right away with this result.
    Value(Value),
    /// Reply once the job concludes. The engine starts it.
    Job(Job),
    /// Reply with `result`, then feed every following byte to `handler`
    /// until it reports [RawFeed::Done].
    Raw {
        /// Result sent before the handoff.
        result: Value,
        /// Consumer of the raw bytes.
        handler: Box<dyn RawHandler>,
    },
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Job(job) => f.debug_tuple("Job").field(job).finish(),
            Self::Raw { result, .. } => f.debug_struct("Raw").field("result", result).finish_non_exhaustive(),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Job> for Reply {
    fn from(job: Job) -> Self {
        Self::Job(job)
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Self::Value(Value::Null)
    }
}

impl From<bool> for Reply {
    fn from(value: bool) -> Self {
        Self::Value(Value::Bool(value))
    }
}

impl From<String> for Reply {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<&str> for Reply {
    fn from(value: &str) -> Self {
        Self::Value(Value::from(value))
    }
}

/// Error returned by a method.
///
/// Any [std::error::Error] converts into [MethodError::Uncaught] with `?`;
/// build [MethodError::Rpc] to reply with a specific code.
pub enum MethodError {
    /// Reply with exactly this error object.
    Rpc(ErrorObject),
    /// Anything else. Replied as `-32000 uncaught exception` with the name
    /// and arguments in `data`.
    Uncaught {
        /// Type of the error, or `panic`.
        name: String,
        /// The error message followed by its sources.
        args: Vec<String>,
    },
}

impl MethodError {
    /// Reply with a specific error.
    pub fn rpc(error: impl Into<ErrorObject>) -> Self {
        Self::Rpc(error.into())
    }

    /// `-32602 invalid params` with a human readable detail.
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::Rpc(ErrorObject::new(ErrorCode::InvalidParams).with_data(Value::String(detail.into())))
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic".to_owned()
        };
        Self::Uncaught {
            name: "panic".to_owned(),
            args: vec![message],
        }
    }

    /// The error object put on the wire.
    pub fn into_error_object(self) -> ErrorObject {
        match self {
            Self::Rpc(error) => error,
            Self::Uncaught { name, args } => {
                ErrorObject::new(ErrorCode::UncaughtException).with_data(json!({ "name": name, "args": args }))
            }
        }
    }
}

impl<E> From<E> for MethodError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        let mut args = vec![error.to_string()];
        let mut source = error.source();
        while let Some(cause) = source {
            args.push(cause.to_string());
            source = cause.source();
        }
        Self::Uncaught {
            name: std::any::type_name::<E>().to_owned(),
            args,
        }
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(error) => write!(f, "{}", error),
            Self::Uncaught { name, args } => write!(f, "{}: {}", name, args.join(": ")),
        }
    }
}

impl fmt::Debug for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(error) => f.debug_tuple("Rpc").field(error).finish(),
            Self::Uncaught { name, args } => f
                .debug_struct("Uncaught")
                .field("name", name)
                .field("args", args)
                .finish(),
        }
    }
}

type BoxedHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Reply, MethodError>> + Send + Sync>;

/// Decode params into a method's parameter type.
///
/// Absent params arrive as `null`. Empty `[]` and `{}` fall back to `null`
/// so methods taking nothing accept every empty form.
fn decode_params<P: DeserializeOwned>(params: Value) -> Result<P, MethodError> {
    let empty = match &params {
        Value::Array(items) => items.is_empty(),
        Value::Object(members) => members.is_empty(),
        _ => false,
    };
    match serde_json::from_value(params) {
        Ok(params) => Ok(params),
        Err(error) => {
            if empty {
                if let Ok(params) = serde_json::from_value(Value::Null) {
                    return Ok(params);
                }
            }
            Err(MethodError::invalid_params(error.to_string()))
        }
    }
}

/// Responses and handoffs produced by one incoming JSON value.
#[derive(Default)]
struct Handled {
    response: Option<Value>,
    raw: Option<Box<dyn RawHandler>>,
}

impl Handled {
    fn reply(response: Response) -> Self {
        Self {
            response: Some(response.to_value()),
            raw: None,
        }
    }
}

/// One JSON-RPC peer on one connection.
pub struct JsonRpc {
    connection: Connection,
    methods: DashMap<String, BoxedHandler>,
    jobs: DashMap<u64, Job>,
    next_id: AtomicU64,
}

impl JsonRpc {
    /// Wrap a connection. Call [JsonRpc::run] to start reading from it.
    pub fn new(connection: Connection) -> Arc<Self> {
        Arc::new(Self {
            connection,
            methods: DashMap::new(),
            jobs: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a method, replacing any existing one with the same name.
    ///
    /// `P` is decoded from the request params: positional params decode
    /// into tuples or sequences, named params into structs or maps. A
    /// mismatch is replied as `-32602 invalid params`.
    pub fn add_method<P, F, Fut, R>(&self, name: impl Into<String>, method: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
        R: Into<Reply> + 'static,
    {
        let method = Arc::new(method);
        let handler: BoxedHandler = Arc::new(move |params| {
            let method = method.clone();
            Box::pin(async move {
                let params = decode_params::<P>(params)?;
                method(params).await.map(Into::into)
            })
        });
        self.methods.insert(name.into(), handler);
    }

    /// Number of outbound requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// Send a notification. No reply is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ConnectionError> {
        self.send(&Request::notification(method, params).to_value()).await
    }

    /// Create a request. It is sent when the returned job is started, and
    /// the job concludes when the response arrives: ended with the result,
    /// or failed with the error object. Heartbeats the peer relays for the
    /// request become heartbeats of the job.
    pub fn request(self: &Arc<Self>, method: &str, params: Option<Value>) -> Job {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(id, method);
        self.jobs.insert(id, job.clone());

        let engine = self.clone();
        let pending = job.clone();
        let method = method.to_owned();
        tokio::spawn(async move {
            if pending.started().await && !pending.is_stopped() {
                let request = Request::new(method, params, Value::from(id));
                if let Err(error) = engine.send(&request.to_value()).await {
                    tracing::warn!(id, error = format!("{:?}", error), "failed to send request");
                    pending.fail(json!({ "name": "ConnectionError", "args": [error.to_string()] }));
                }
            }
            pending.stopped().await;
            engine.jobs.remove(&id);
        });

        job
    }

    /// Read and dispatch until the connection ends or is stopped, then fail
    /// whatever is still in flight and close the connection.
    pub async fn run(self: Arc<Self>) {
        let mut reader = JsonReader::new();
        let mut raw = None;

        loop {
            let data = match self.connection.read().await {
                Ok(data) => data,
                Err(ConnectionError::EndOfStream) => {
                    tracing::debug!("connection ended");
                    break;
                }
                Err(error) => {
                    tracing::warn!(error = format!("{:?}", error), "connection read failed");
                    break;
                }
            };
            if data.is_empty() {
                if self.is_stopped() {
                    break;
                }
                continue;
            }
            self.feed(&mut reader, &mut raw, data).await;
        }

        self.fail_in_flight();
        self.connection.close().await;
    }

    async fn feed(self: &Arc<Self>, reader: &mut JsonReader, raw: &mut Option<Box<dyn RawHandler>>, mut data: Vec<u8>) {
        'handoff: loop {
            if let Some(handler) = raw.as_mut() {
                if data.is_empty() {
                    return;
                }
                match handler.feed(&data) {
                    RawFeed::Pending => return,
                    RawFeed::Done { consumed } => {
                        tracing::debug!(consumed, "raw handler finished");
                        *raw = None;
                        data.drain(..consumed.min(data.len()));
                    }
                }
            }

            reader.push(&data);
            while let Some(parsed) = reader.next_value() {
                let handled = match parsed {
                    Ok(value) => self.process(value).await,
                    Err(error) => {
                        tracing::warn!(error = format!("{:?}", error), "unparseable message");
                        Handled::reply(Response::failure(Value::Null, ErrorCode::ParseError.into()))
                    }
                };

                if let Some(response) = handled.response {
                    if let Err(error) = self.send(&response).await {
                        tracing::warn!(error = format!("{:?}", error), "failed to send response");
                    }
                }
                if let Some(handler) = handled.raw {
                    tracing::debug!("handing the stream to a raw handler");
                    *raw = Some(handler);
                    data = reader.take_buffered();
                    continue 'handoff;
                }
            }
            return;
        }
    }

    async fn process(self: &Arc<Self>, value: Value) -> Handled {
        let Value::Array(batch) = value else {
            return self.process_message(value).await;
        };
        if batch.is_empty() {
            return Handled::reply(Response::failure(Value::Null, ErrorCode::InvalidRequest.into()));
        }

        let mut responses = vec![];
        let mut raw = None;
        for value in batch {
            let handled = self.process_message(value).await;
            responses.extend(handled.response);
            if let Some(handler) = handled.raw {
                if raw.is_some() {
                    tracing::warn!("more than one raw handoff in a batch; keeping the first");
                } else {
                    raw = Some(handler);
                }
            }
        }

        Handled {
            response: (!responses.is_empty()).then_some(Value::Array(responses)),
            raw,
        }
    }

    async fn process_message(self: &Arc<Self>, value: Value) -> Handled {
        match Message::classify(value) {
            Message::Request(request) if request.id.is_none() && request.method == HEARTBEAT_METHOD => {
                self.handle_heartbeat(request.params);
                Handled::default()
            }
            Message::Request(request) => self.handle_request(request).await,
            Message::Response(response) => {
                self.handle_response(response);
                Handled::default()
            }
            Message::Invalid { id, reason } => {
                tracing::warn!(id = %id, reason, "invalid request");
                Handled::reply(Response::failure(id, ErrorCode::InvalidRequest.into()))
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, request: Request) -> Handled {
        let Request { method, params, id } = request;
        let reply = self.invoke(&method, params).await;

        match (reply, id) {
            (Ok(Reply::Value(result)), Some(id)) => Handled::reply(Response::success(id, result)),
            (Ok(Reply::Value(_)), None) => Handled::default(),
            (Ok(Reply::Job(job)), id) => {
                self.reply_when_concluded(job, id);
                Handled::default()
            }
            (Ok(Reply::Raw { result, handler }), id) => Handled {
                response: id.map(|id| Response::success(id, result).to_value()),
                raw: Some(handler),
            },
            (Err(error), Some(id)) => Handled::reply(Response::failure(id, error)),
            (Err(_), None) => Handled::default(),
        }
    }

    async fn invoke(&self, method: &str, params: Option<Value>) -> Result<Reply, ErrorObject> {
        let Some(handler) = self.methods.get(method).map(|handler| handler.value().clone()) else {
            tracing::debug!(method, "method not found");
            return Err(ErrorCode::MethodNotFound.into());
        };

        let params = match params {
            None => Value::Null,
            Some(params @ (Value::Array(_) | Value::Object(_))) => params,
            Some(_) => return Err(ErrorCode::InvalidParams.into()),
        };

        let error = match AssertUnwindSafe(handler(params)).catch_unwind().await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(error)) => error,
            Err(panic) => MethodError::from_panic(panic),
        };
        if let MethodError::Uncaught { name, args } = &error {
            tracing::error!(method, name = name.as_str(), args = format!("{:?}", args), "method failed");
        }
        Err(error.into_error_object())
    }

    fn reply_when_concluded(self: &Arc<Self>, job: Job, id: Option<Value>) {
        let engine = self.clone();
        let waiting = job.clone();
        let mut events = job.subscribe();
        tokio::spawn(async move {
            let conclusion = loop {
                tokio::select! {
                    biased;
                    event = events.recv() => match event {
                        Ok(JobEvent::Heartbeat(progress)) => {
                            if let Some(id) = &id {
                                engine.relay_heartbeat(&waiting, id, progress).await;
                            }
                        }
                        Ok(JobEvent::Stopped(conclusion)) => break conclusion,
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            tracing::debug!(job = waiting.id(), missed, "skipped heartbeats of a busy job");
                        }
                        Err(RecvError::Closed) => break waiting.stopped().await,
                    },
                    conclusion = waiting.stopped() => break conclusion,
                }
            };
            let Some(id) = id else {
                return;
            };
            let response = match conclusion {
                Conclusion::Ended(result) => Response::success(id, result),
                Conclusion::Failed(failure) => {
                    Response::failure(id, ErrorObject::new(ErrorCode::JobFailed).with_data(failure))
                }
                Conclusion::Canceled => Response::failure(id, ErrorCode::JobCanceled.into()),
            };
            if let Err(error) = engine.send(&response.to_value()).await {
                tracing::warn!(
                    job = waiting.id(),
                    error = format!("{:?}", error),
                    "failed to send job response"
                );
            }
        });
        job.start();
    }

    async fn relay_heartbeat(&self, job: &Job, id: &Value, progress: Value) {
        let params = json!({ "id": id, "progress": progress });
        let notification = Request::notification(HEARTBEAT_METHOD, Some(params));
        if let Err(error) = self.send(&notification.to_value()).await {
            tracing::debug!(job = job.id(), error = format!("{:?}", error), "failed to relay heartbeat");
        }
    }

    fn handle_heartbeat(&self, params: Option<Value>) {
        let params = match serde_json::from_value::<HeartbeatParams>(params.unwrap_or_default()) {
            Ok(params) => params,
            Err(error) => {
                tracing::warn!(error = format!("{:?}", error), "malformed heartbeat; ignoring");
                return;
            }
        };
        let Some(job) = self.jobs.get(&params.id).map(|entry| entry.value().clone()) else {
            tracing::debug!(id = params.id, "heartbeat for unknown request id; ignoring");
            return;
        };
        job.heartbeat(params.progress);
    }

    fn handle_response(&self, response: Response) {
        let job = response
            .id
            .as_u64()
            .and_then(|id| self.jobs.remove(&id))
            .map(|(_, job)| job);
        let Some(job) = job else {
            tracing::warn!(id = %response.id, "response for unknown request id; ignoring");
            return;
        };

        match response.outcome {
            Ok(result) => job.end(result),
            Err(error) => {
                let failure = serde_json::to_value(&error).unwrap_or_else(|_| Value::String(error.to_string()));
                job.fail(failure)
            }
        };
    }

    fn fail_in_flight(&self) {
        let ids: Vec<u64> = self.jobs.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, job)) = self.jobs.remove(&id) {
                tracing::debug!(id, "failing in-flight request; connection closed");
                job.fail(json!({
                    "name": "ConnectionClosed",
                    "args": ["connection closed before a response arrived"],
                }));
            }
        }
    }

    async fn send(&self, message: &Value) -> Result<(), ConnectionError> {
        let data = serde_json::to_vec(message).map_err(std::io::Error::from)?;
        self.connection.write(&data).await
    }

    /// Interrupt the read loop and any pending write. Idempotent.
    pub fn stop(&self) {
        self.connection.stop();
    }

    /// Stop and release the connection. Idempotent; never fails.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// True once stopped or closed.
    pub fn is_stopped(&self) -> bool {
        self.connection.is_stopped()
    }
}
