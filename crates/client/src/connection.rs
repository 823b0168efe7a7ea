//! One live socket: a reader task, a writer task and the pending map.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    SinkExt, StreamExt,
    future::join_all,
    stream::{SplitSink, SplitStream},
};
use parking_lot::Mutex;
use serde_json::Value;
use tern_rpc::{BatchEncoding, Incoming, Notification, Request, Response, RpcCodec};
use tern_types::{ServerDescriptor, TernError, TernResult};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::transport::BoxedStream;

type Lines = Framed<BoxedStream, LinesCodec>;
type Waiter = oneshot::Sender<TernResult<Value>>;

const OUTGOING_CAPACITY: usize = 256;
const DRAIN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct Shared {
    key: String,
    pending: Mutex<HashMap<u64, Waiter>>,
    closed: watch::Sender<bool>,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn lost(&self) -> TernError {
        TernError::ConnectionLost { server: self.key.clone() }
    }

    fn complete(&self, response: Response) {
        let Some(id) = response.request_id() else {
            warn!(server = %self.key, id = %response.id, "response with unusable id");
            return;
        };
        match self.pending.lock().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(response.into_result());
            }
            None => trace!(server = %self.key, id, "response for unknown or expired request"),
        }
    }

    /// Mark closed and fail every waiter with `error`.
    fn shutdown(&self, error: TernError) {
        if self.closed.send_replace(true) {
            return;
        }
        let waiters: Vec<Waiter> = self.pending.lock().drain().map(|(_, w)| w).collect();
        debug!(server = %self.key, pending = waiters.len(), reason = %error, "connection closed");
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

/// A connected socket to one Electrum server.
///
/// Responses are matched to requests by id, so they may arrive in any order.
/// Lines without an id are subscription pushes and are forwarded to the
/// notification channel. When the socket closes every pending request fails
/// with [`TernError::ConnectionLost`].
#[derive(Debug)]
pub(crate) struct Connection {
    server: ServerDescriptor,
    codec: RpcCodec,
    ids: Arc<AtomicU64>,
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Vec<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Take ownership of `stream` and start the reader and writer tasks.
    pub(crate) fn open(
        stream: BoxedStream,
        server: ServerDescriptor,
        codec: RpcCodec,
        ids: Arc<AtomicU64>,
        notifications: broadcast::Sender<Notification>,
    ) -> Self {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(codec.max_line_size()));
        let (sink, lines) = framed.split();
        let (outgoing, queue) = mpsc::channel(OUTGOING_CAPACITY);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            key: server.key(),
            pending: Mutex::new(HashMap::new()),
            closed,
            last_activity: Mutex::new(Instant::now()),
        });

        let reader = tokio::spawn(read_loop(lines, shared.clone(), codec, notifications));
        let writer = tokio::spawn(write_loop(sink, queue, shared.clone()));

        Self { server, codec, ids, shared, outgoing, tasks: Mutex::new(vec![reader, writer]) }
    }

    pub(crate) const fn server(&self) -> &ServerDescriptor {
        &self.server
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the socket has closed, for whatever reason.
    pub(crate) async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Time since the last byte was written or read.
    pub(crate) fn idle_for(&self) -> Duration {
        self.shared.last_activity.lock().elapsed()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Close the socket and fail whatever is still pending.
    pub(crate) fn close(&self) {
        self.shared.shutdown(self.shared.lost());
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Wait up to `timeout` for in-flight requests to settle, then close.
    pub(crate) async fn drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.pending_count() > 0 && !self.is_closed() && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        self.close();
    }

    /// Send one request and wait for its response.
    pub(crate) async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> TernResult<Value> {
        let mut registered = self.register(1)?;
        let Some((id, rx)) = registered.pop() else {
            return Err(TernError::Internal("no request id allocated".to_string()));
        };
        let line = match self.codec.encode_request(&Request::new(id, method, params)) {
            Ok(line) => line,
            Err(e) => {
                self.forget(&[id]);
                return Err(e);
            }
        };
        self.send(vec![line], &[id]).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.shared.lost()),
            Err(_) => {
                self.forget(&[id]);
                Err(TernError::RequestTimeout { method: method.to_string(), timeout })
            }
        }
    }

    /// Send a group of requests in one write and wait for all of them.
    ///
    /// Per-request server errors are returned in place; a transport failure
    /// affecting any request fails the whole group.
    pub(crate) async fn call_batch(
        &self,
        calls: &[(String, Vec<Value>)],
        encoding: BatchEncoding,
        timeout: Duration,
    ) -> TernResult<Vec<TernResult<Value>>> {
        let registered = self.register(calls.len())?;
        let ids: Vec<u64> = registered.iter().map(|(id, _)| *id).collect();
        let requests: Vec<Request> = calls
            .iter()
            .zip(&ids)
            .map(|((method, params), id)| Request::new(*id, method.as_str(), params.clone()))
            .collect();
        let lines = match self.codec.encode_batch(&requests, encoding) {
            Ok(lines) => lines,
            Err(e) => {
                self.forget(&ids);
                return Err(e);
            }
        };
        self.send(lines, &ids).await?;

        let receivers = registered.into_iter().map(|(_, rx)| rx);
        let outcomes = match tokio::time::timeout(timeout, join_all(receivers)).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                self.forget(&ids);
                return Err(TernError::BatchTimeout { count: calls.len(), timeout });
            }
        };

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(Err(e)) if e.should_retry() => return Err(e),
                Ok(result) => results.push(result),
                Err(_) => return Err(self.shared.lost()),
            }
        }
        Ok(results)
    }

    fn register(&self, count: usize) -> TernResult<Vec<(u64, oneshot::Receiver<TernResult<Value>>)>> {
        let mut pending = self.shared.pending.lock();
        if *self.shared.closed.borrow() {
            return Err(self.shared.lost());
        }
        Ok((0..count)
            .map(|_| {
                let id = self.ids.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                pending.insert(id, tx);
                (id, rx)
            })
            .collect())
    }

    fn forget(&self, ids: &[u64]) {
        let mut pending = self.shared.pending.lock();
        for id in ids {
            pending.remove(id);
        }
    }

    async fn send(&self, lines: Vec<String>, ids: &[u64]) -> TernResult<()> {
        if self.outgoing.send(lines).await.is_err() {
            self.forget(ids);
            return Err(self.shared.lost());
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    mut lines: SplitStream<Lines>,
    shared: Arc<Shared>,
    codec: RpcCodec,
    notifications: broadcast::Sender<Notification>,
) {
    let reason = loop {
        let line = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                break TernError::Protocol(format!(
                    "line exceeds {} bytes",
                    codec.max_line_size()
                ));
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!(server = %shared.key, error = %e, "read failed");
                break shared.lost();
            }
            None => break shared.lost(),
        };
        shared.touch();
        if line.trim().is_empty() {
            continue;
        }

        match codec.decode(&line) {
            Ok(Incoming::Responses(responses)) => {
                for response in responses {
                    shared.complete(response);
                }
            }
            Ok(Incoming::Notification(notification)) => {
                trace!(server = %shared.key, method = %notification.method, "notification");
                let _ = notifications.send(notification);
            }
            Err(e) => {
                warn!(server = %shared.key, error = %e, "malformed line, dropping connection");
                break e;
            }
        }
    };
    shared.shutdown(reason);
}

async fn write_loop(
    mut sink: SplitSink<Lines, String>,
    mut queue: mpsc::Receiver<Vec<String>>,
    shared: Arc<Shared>,
) {
    let mut closed = shared.closed.subscribe();
    loop {
        let lines = tokio::select! {
            lines = queue.recv() => match lines {
                Some(lines) => lines,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        };
        for line in lines {
            if let Err(e) = sink.feed(line).await {
                debug!(server = %shared.key, error = %e, "write failed");
                shared.shutdown(shared.lost());
                return;
            }
        }
        if let Err(e) = sink.flush().await {
            debug!(server = %shared.key, error = %e, "flush failed");
            shared.shutdown(shared.lost());
            return;
        }
        shared.touch();
    }
    let _ = sink.close().await;
}
