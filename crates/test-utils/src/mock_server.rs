//! A scripted Electrum server on a real TCP socket.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tern_rpc::{JsonRpcError, Request, Response, RpcCodec, methods};
use tern_types::ServerDescriptor;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LinesCodec};

use crate::fixtures;

/// How the mock answers one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with a result.
    Result(Value),
    /// Answer with a JSON-RPC error object.
    Error {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
    },
    /// Wait, then answer with the inner reply.
    Delay(Duration, Box<MockReply>),
    /// Never answer.
    Silent,
    /// Close the connection instead of answering.
    Disconnect,
}

impl MockReply {
    /// Shorthand for [`MockReply::Result`].
    pub fn result(value: Value) -> Self {
        Self::Result(value)
    }

    /// Shorthand for [`MockReply::Error`].
    pub fn error(code: i64, message: &str) -> Self {
        Self::Error { code, message: message.to_string() }
    }

    /// Wrap `self` in a delay.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delay(delay, Box::new(self))
    }
}

#[derive(Debug, Clone)]
enum Command {
    Push(String),
    Disconnect,
}

#[derive(Debug)]
struct MockState {
    banner: Mutex<String>,
    height: AtomicU32,
    handlers: Mutex<HashMap<(String, Option<String>), MockReply>>,
    queued: Mutex<HashMap<String, VecDeque<MockReply>>>,
    requests: Mutex<Vec<Request>>,
    reject_array_batches: AtomicBool,
    reverse_batches: AtomicBool,
    accepting: AtomicBool,
    connections: AtomicUsize,
    array_batches: AtomicUsize,
    commands: broadcast::Sender<Command>,
}

impl MockState {
    fn reply_for(&self, request: &Request) -> MockReply {
        if let Some(reply) =
            self.queued.lock().get_mut(&request.method).and_then(VecDeque::pop_front)
        {
            return reply;
        }
        let first = request.params.first().and_then(Value::as_str).map(str::to_string);
        let handlers = self.handlers.lock();
        if let Some(reply) = handlers.get(&(request.method.clone(), first)) {
            return reply.clone();
        }
        if let Some(reply) = handlers.get(&(request.method.clone(), None)) {
            return reply.clone();
        }
        drop(handlers);
        self.default_reply(&request.method)
    }

    fn default_reply(&self, method: &str) -> MockReply {
        let height = self.height.load(Ordering::SeqCst);
        match method {
            methods::SERVER_VERSION => {
                MockReply::Result(json!([self.banner.lock().clone(), methods::PROTOCOL_VERSION]))
            }
            methods::SERVER_PING => MockReply::Result(Value::Null),
            methods::SERVER_FEATURES => MockReply::Result(json!({
                "pruning": null,
                "protocol_min": "1.4",
                "protocol_max": methods::PROTOCOL_VERSION,
            })),
            methods::HEADERS_SUBSCRIBE => MockReply::Result(fixtures::tip_header(height)),
            methods::SCRIPTHASH_SUBSCRIBE => MockReply::Result(Value::Null),
            methods::SCRIPTHASH_UNSUBSCRIBE => MockReply::Result(Value::Bool(true)),
            methods::SCRIPTHASH_LISTUNSPENT | methods::SCRIPTHASH_GET_HISTORY => {
                MockReply::Result(json!([]))
            }
            methods::ESTIMATE_FEE => MockReply::Result(json!(0.0001)),
            methods::BLOCK_HEADER => MockReply::Result(Value::String(fixtures::GENESIS_HEADER.into())),
            other => MockReply::error(-32601, &format!("unknown method {other}")),
        }
    }
}

/// A scripted Electrum server listening on `127.0.0.1`.
///
/// Unscripted methods get sensible defaults: `server.version` answers with
/// the configured banner, `blockchain.headers.subscribe` with the configured
/// height, and list queries with empty arrays.
///
/// Dropping the server closes the listener and every connection.
#[derive(Debug)]
pub struct MockElectrumServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockElectrumServer {
    /// Bind to an ephemeral port and start serving.
    pub async fn start() -> Self {
        let listener =
            TcpListener::bind("127.0.0.1:0").await.expect("failed to bind mock electrum server");
        let addr = listener.local_addr().expect("listener has no local address");
        let (commands, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            banner: Mutex::new("ElectrumX 1.16.0".to_string()),
            height: AtomicU32::new(840_000),
            handlers: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            reject_array_batches: AtomicBool::new(false),
            reverse_batches: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            array_batches: AtomicUsize::new(0),
            commands,
        });
        let tasks = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_tasks = tasks.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if !accept_state.accepting.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let handle = tokio::spawn(serve(stream, accept_state.clone()));
                accept_tasks.lock().push(handle);
            }
        });
        tasks.lock().push(accept);

        Self { addr, state, tasks }
    }

    /// The bound address.
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Plain-TCP descriptor for this server.
    pub fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor::tcp(self.addr.ip().to_string(), self.addr.port())
    }

    /// Set the `server.version` software banner.
    pub fn set_banner(&self, banner: &str) {
        *self.state.banner.lock() = banner.to_string();
    }

    /// Set the height reported by `blockchain.headers.subscribe`.
    pub fn set_height(&self, height: u32) {
        self.state.height.store(height, Ordering::SeqCst);
    }

    /// Answer every `method` request with `reply`.
    pub fn on(&self, method: &str, reply: MockReply) {
        self.state.handlers.lock().insert((method.to_string(), None), reply);
    }

    /// Answer `method` requests whose first parameter is `param` with `reply`.
    pub fn on_param(&self, method: &str, param: &str, reply: MockReply) {
        self.state.handlers.lock().insert((method.to_string(), Some(param.to_string())), reply);
    }

    /// Answer the next `method` request with `reply`, before any handler.
    pub fn queue(&self, method: &str, reply: MockReply) {
        self.state.queued.lock().entry(method.to_string()).or_default().push_back(reply);
    }

    /// Drop the connection when a JSON array batch arrives, like older
    /// electrs releases.
    pub fn set_reject_array_batches(&self, reject: bool) {
        self.state.reject_array_batches.store(reject, Ordering::SeqCst);
    }

    /// Answer array batches in reverse order.
    pub fn set_reverse_batches(&self, reverse: bool) {
        self.state.reverse_batches.store(reverse, Ordering::SeqCst);
    }

    /// Stop accepting new connections (existing ones stay up).
    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Push a notification to every connected client.
    pub fn notify(&self, method: &str, params: Value) {
        let line = json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string();
        let _ = self.state.commands.send(Command::Push(line));
    }

    /// Push a script hash status change.
    pub fn notify_script_hash(&self, script_hash: &str, status: &str) {
        self.notify(methods::SCRIPTHASH_SUBSCRIBE, json!([script_hash, status]));
    }

    /// Push a new tip.
    pub fn notify_header(&self, height: u32) {
        self.set_height(height);
        self.notify(methods::HEADERS_SUBSCRIBE, json!([fixtures::tip_header(height)]));
    }

    /// Close every open connection.
    pub fn disconnect_all(&self) {
        let _ = self.state.commands.send(Command::Disconnect);
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().clone()
    }

    /// Number of requests received for `method`.
    pub fn request_count(&self, method: &str) -> usize {
        self.state.requests.lock().iter().filter(|r| r.method == method).count()
    }

    /// Number of accepted connections so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of JSON array batches received.
    pub fn array_batch_count(&self) -> usize {
        self.state.array_batches.load(Ordering::SeqCst)
    }
}

impl Drop for MockElectrumServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// A descriptor for a local port with nothing listening on it.
pub async fn closed_port() -> ServerDescriptor {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
    let port = listener.local_addr().expect("listener has no local address").port();
    drop(listener);
    ServerDescriptor::tcp("127.0.0.1", port)
}

async fn serve(stream: TcpStream, state: Arc<MockState>) {
    let codec = RpcCodec::default();
    let mut framed = Framed::new(stream, LinesCodec::new());
    let mut commands = state.commands.subscribe();

    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(Ok(line)) = line else { return };
                let Ok((requests, is_array)) = codec.decode_requests(&line) else { return };
                state.requests.lock().extend(requests.iter().cloned());
                if is_array {
                    state.array_batches.fetch_add(1, Ordering::SeqCst);
                    if state.reject_array_batches.load(Ordering::SeqCst) {
                        return;
                    }
                }

                let mut responses = Vec::with_capacity(requests.len());
                for request in &requests {
                    match resolve(state.reply_for(request)).await {
                        Resolved::Respond(reply) => responses.push(to_response(request.id, reply)),
                        Resolved::Silent => {}
                        Resolved::Disconnect => return,
                    }
                }

                if is_array {
                    if responses.is_empty() {
                        continue;
                    }
                    if state.reverse_batches.load(Ordering::SeqCst) {
                        responses.reverse();
                    }
                    let Ok(line) = serde_json::to_string(&responses) else { return };
                    if framed.send(line).await.is_err() {
                        return;
                    }
                } else {
                    for response in responses {
                        let Ok(line) = serde_json::to_string(&response) else { return };
                        if framed.send(line).await.is_err() {
                            return;
                        }
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Ok(Command::Push(line)) => {
                        if framed.send(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(Command::Disconnect) | Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }
}

enum Resolved {
    Respond(MockReply),
    Silent,
    Disconnect,
}

async fn resolve(mut reply: MockReply) -> Resolved {
    loop {
        match reply {
            MockReply::Delay(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
            MockReply::Silent => return Resolved::Silent,
            MockReply::Disconnect => return Resolved::Disconnect,
            other => return Resolved::Respond(other),
        }
    }
}

fn to_response(id: u64, reply: MockReply) -> Response {
    match reply {
        MockReply::Error { code, message } => Response::error(id, JsonRpcError::new(code, message)),
        MockReply::Result(value) => Response::success(id, value),
        _ => Response::success(id, Value::Null),
    }
}
