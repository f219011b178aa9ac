//! Client engine: sequence-numbered request multiplexing.
//!
//! A [`Client`] owns one outbound connection. Requests are written with
//! strictly increasing sequence numbers; a single reader task demultiplexes
//! incoming responses back to their pending calls by seq, routes pushes
//! through the [`CallbackManager`], and on any terminal read error fails
//! every pending call and fires disconnect subscribers.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::dial("127.0.0.1:9000").await?;
//! let args = CallArgs::new()
//!     .input(&Args { a: 1, b: 2 })?
//!     .output(&Reply { num: 0 })?;
//! let call = client.call("DummyService.Sum", args).await?;
//! let reply: Reply = call.output(0)?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use crate::callback::{CallbackId, CallbackManager};
use crate::codec::{RpcCodec, TaggedValue};
use crate::context::CancelScope;
use crate::error::{Result, RpcError};
use crate::http;
use crate::protocol::{Request, Response, ResponseKind};

/// Synthesized value dispatched to disconnect subscribers when the
/// connection enters shutdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Disconnected;

#[derive(Debug)]
struct ArgSlot {
    value: TaggedValue,
    is_output: bool,
}

/// Positional argument bundle for one call.
///
/// Inputs are plain positions; outputs are positions the server returns.
/// The initial value of an output position still travels in the request, so
/// handlers see the caller's starting value.
#[derive(Debug, Default)]
pub struct CallArgs {
    slots: Vec<ArgSlot>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an input position.
    pub fn input<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.slots.push(ArgSlot {
            value: TaggedValue::encode(value)?,
            is_output: false,
        });
        Ok(self)
    }

    /// Append an output position with its initial value.
    pub fn output<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.slots.push(ArgSlot {
            value: TaggedValue::encode(value)?,
            is_output: true,
        });
        Ok(self)
    }

    /// Number of declared positions.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of output positions.
    pub fn output_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_output).count()
    }

    fn bundle(&self) -> Vec<TaggedValue> {
        self.slots.iter().map(|s| s.value.clone()).collect()
    }

    /// Store decoded response outputs into the output positions, in order.
    fn assign_outputs(&mut self, outputs: Vec<TaggedValue>) -> Result<()> {
        let mut incoming = outputs.into_iter();
        for slot in self.slots.iter_mut().filter(|s| s.is_output) {
            let value = incoming.next().ok_or_else(|| {
                RpcError::Protocol("response did not include all output values".to_string())
            })?;
            if value.tag != slot.value.tag {
                return Err(RpcError::Protocol(format!(
                    "output is of type {} and the expected type is {}",
                    value.tag, slot.value.tag
                )));
            }
            slot.value = value;
        }
        if incoming.next().is_some() {
            return Err(RpcError::Protocol(
                "response carried more output values than expected".to_string(),
            ));
        }
        Ok(())
    }
}

/// One invocation, handed back through its completion channel.
#[derive(Debug)]
pub struct Call {
    /// The `Service.Method` name that was invoked.
    pub method: String,
    /// The call's positional arguments; outputs hold responded values after
    /// successful completion.
    pub args: CallArgs,
    /// Error status after completion; `None` means success.
    pub error: Option<RpcError>,
    seq: u64,
}

impl Call {
    fn new(method: &str, args: CallArgs) -> Self {
        Self {
            method: method.to_string(),
            args,
            error: None,
            seq: 0,
        }
    }

    /// Sequence number assigned to this call.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Decode the value of the i-th output position.
    pub fn output<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let slot = self
            .args
            .slots
            .iter()
            .filter(|s| s.is_output)
            .nth(index)
            .ok_or_else(|| RpcError::Protocol(format!("no output position {index}")))?;
        slot.value.decode()
    }
}

#[derive(Default)]
struct ClientState {
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    closing: bool,
    shutdown: bool,
}

struct PendingCall {
    call: Call,
    done: mpsc::Sender<Call>,
}

impl PendingCall {
    /// Complete with an error. Signaling never blocks; if the caller's
    /// channel is full the completion is dropped.
    fn fail(self, err: RpcError) {
        let mut call = self.call;
        call.error = Some(err);
        let _ = self.done.try_send(call);
    }
}

struct ClientInner {
    codec: RpcCodec,
    cbmgr: CallbackManager,
    /// Serializes the whole send path so seq assignment and the request
    /// write cannot interleave between calls.
    sending: tokio::sync::Mutex<()>,
    state: Mutex<ClientState>,
    cancel: CancelScope,
}

/// RPC client over one duplex connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Take ownership of an established duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inner = Arc::new(ClientInner {
            codec: RpcCodec::new(stream),
            cbmgr: CallbackManager::new(),
            sending: tokio::sync::Mutex::new(()),
            state: Mutex::new(ClientState::default()),
            cancel: CancelScope::new(),
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            reader.process_input().await;
        });

        Client { inner }
    }

    /// Connect over raw TCP.
    pub async fn dial<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    /// Connect over TCP and upgrade through the HTTP `CONNECT` handshake on
    /// the default path.
    pub async fn dial_http<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::dial_http_path(addr, http::DEFAULT_RPC_PATH).await
    }

    /// Connect over TCP and upgrade through the HTTP `CONNECT` handshake on
    /// an explicit path.
    pub async fn dial_http_path<A: ToSocketAddrs>(addr: A, path: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        http::client_handshake(&mut stream, path).await?;
        Ok(Self::new(stream))
    }

    /// Register a value type with the codec so incoming elements tagged with
    /// it are verified. Idempotent.
    pub fn register_type<T: DeserializeOwned + 'static>(&self) {
        self.inner.codec.register_type::<T>();
    }

    /// Invoke a remote method asynchronously.
    ///
    /// The completed [`Call`] is delivered through `done`. The channel's
    /// buffer must cover the number of in-flight calls sharing it;
    /// completions that do not fit are dropped.
    pub async fn go(&self, method: &str, args: CallArgs, done: mpsc::Sender<Call>) {
        self.inner.send(Call::new(method, args), done).await;
    }

    /// Invoke a remote method and wait for it to complete.
    ///
    /// On success the returned [`Call`] carries the responded output values;
    /// the error of a failed call is returned directly.
    pub async fn call(&self, method: &str, args: CallArgs) -> Result<Call> {
        let (tx, mut rx) = mpsc::channel(1);
        self.go(method, args, tx).await;
        let mut call = rx.recv().await.ok_or(RpcError::Shutdown)?;
        match call.error.take() {
            Some(err) => Err(err),
            None => Ok(call),
        }
    }

    /// Subscribe a handler for pushed values of type `T`.
    pub fn subscribe_to_push<T, F>(&self, handler: F) -> CallbackId
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.inner.cbmgr.subscribe(handler)
    }

    /// Subscribe a handler fired once when the connection enters shutdown.
    pub fn subscribe_to_disconnect<F>(&self, handler: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.cbmgr.subscribe::<Disconnected, _>(move |_| handler())
    }

    /// Remove a push or disconnect subscription.
    pub fn unsubscribe(&self, id: &CallbackId) {
        self.inner.cbmgr.unsubscribe(id);
    }

    /// Close the connection.
    ///
    /// The first call marks the client closing and closes the codec; any
    /// later call returns [`RpcError::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("client state lock poisoned");
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        self.inner.cancel.cancel();
        self.inner.codec.close().await
    }
}

impl ClientInner {
    async fn send(&self, mut call: Call, done: mpsc::Sender<Call>) {
        let _send_guard = self.sending.lock().await;

        let method = call.method.clone();
        let body = call.args.bundle();

        let seq = {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if state.closing || state.shutdown {
                drop(state);
                call.error = Some(RpcError::Shutdown);
                let _ = done.try_send(call);
                return;
            }
            let seq = state.seq;
            state.seq += 1;
            call.seq = seq;
            state.pending.insert(seq, PendingCall { call, done });
            seq
        };

        let request = Request { method, seq };
        if let Err(err) = self.codec.write_request(&request, &body).await {
            let removed = self
                .state
                .lock()
                .expect("client state lock poisoned")
                .pending
                .remove(&seq);
            if let Some(pending) = removed {
                pending.fail(err);
            }
        }
    }

    /// Reader task: demultiplex responses and pushes until the stream dies.
    async fn process_input(self: Arc<Self>) {
        let err = loop {
            let mut header = Response::default();
            let read = tokio::select! {
                r = self.codec.read_response_header(&mut header) => r,
                _ = self.cancel.cancelled() => Err(RpcError::Eof),
            };
            if let Err(e) = read {
                break e;
            }
            let step = match header.kind {
                ResponseKind::Rpc => self.process_rpc(&header).await,
                ResponseKind::Push => self.process_push().await,
            };
            if let Err(e) = step {
                break e;
            }
        };
        self.terminate(err).await;
    }

    async fn process_rpc(&self, header: &Response) -> Result<()> {
        let pending = self
            .state
            .lock()
            .expect("client state lock poisoned")
            .pending
            .remove(&header.seq);

        let Some(pending) = pending else {
            // Usually a partially failed write whose call was already
            // removed; the server is reporting its side of the story.
            if header.error.is_empty() {
                self.codec.read_body_discard().await?;
            } else {
                tracing::warn!("response for unknown seq {}: {}", header.seq, header.error);
            }
            return Ok(());
        };

        if !header.error.is_empty() {
            pending.fail(RpcError::Remote(header.error.clone()));
            return Ok(());
        }

        match self.codec.read_body_bundle().await {
            Ok(outputs) => {
                let PendingCall { mut call, done } = pending;
                if let Err(e) = call.args.assign_outputs(outputs) {
                    call.error = Some(e);
                }
                let _ = done.try_send(call);
                Ok(())
            }
            Err(e) if e.is_terminal() => {
                pending.fail(RpcError::Protocol(format!("reading body: {e}")));
                Err(e)
            }
            Err(e) => {
                pending.fail(RpcError::Protocol(format!("reading body: {e}")));
                Ok(())
            }
        }
    }

    async fn process_push(&self) -> Result<()> {
        match self.codec.read_body_value().await {
            Ok(value) => {
                self.cbmgr
                    .send_raw(&value.tag, Bytes::from(value.bytes.into_vec()));
                Ok(())
            }
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                tracing::warn!("dropping undecodable push: {}", e);
                Ok(())
            }
        }
    }

    /// Fail every pending call and fire disconnect subscribers.
    async fn terminate(&self, err: RpcError) {
        let _send_guard = self.sending.lock().await;
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            state.shutdown = true;
            let err = match err {
                RpcError::Eof if state.closing => RpcError::Shutdown,
                RpcError::Eof => RpcError::UnexpectedEof,
                other => other,
            };
            for (_, pending) in state.pending.drain() {
                pending.fail(err.replicate());
            }
            tracing::debug!("client read loop terminated: {}", err);
        }
        drop(_send_guard);

        if let Err(e) = self.cbmgr.send_to_all(&Disconnected) {
            tracing::warn!("dispatching disconnect: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Body;
    use std::time::Duration;
    use tokio::io::duplex;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Args {
        a: i32,
        b: i32,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Reply {
        num: i32,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct PushData {
        a: i32,
        b: i32,
    }

    #[test]
    fn test_call_args_positions() {
        let args = CallArgs::new()
            .input(&Args { a: 1, b: 2 })
            .unwrap()
            .output(&Reply { num: 100 })
            .unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args.output_count(), 1);

        let bundle = args.bundle();
        assert_eq!(bundle[0].decode::<Args>().unwrap(), Args { a: 1, b: 2 });
        assert_eq!(bundle[1].decode::<Reply>().unwrap(), Reply { num: 100 });
    }

    #[test]
    fn test_assign_outputs_fills_output_slots() {
        let mut args = CallArgs::new()
            .input(&Args { a: 1, b: 2 })
            .unwrap()
            .output(&Reply { num: 100 })
            .unwrap();

        args.assign_outputs(vec![TaggedValue::encode(&Reply { num: 3 }).unwrap()])
            .unwrap();

        let call = Call::new("DummyService.Sum", args);
        assert_eq!(call.output::<Reply>(0).unwrap(), Reply { num: 3 });
    }

    #[test]
    fn test_assign_outputs_count_mismatch() {
        let mut args = CallArgs::new().output(&Reply { num: 0 }).unwrap();
        let err = args.assign_outputs(vec![]).unwrap_err();
        assert!(err.to_string().contains("did not include all output values"));

        let mut args = CallArgs::new().input(&Args { a: 1, b: 2 }).unwrap();
        let err = args
            .assign_outputs(vec![TaggedValue::encode(&Reply { num: 1 }).unwrap()])
            .unwrap_err();
        assert!(err.to_string().contains("more output values"));
    }

    #[test]
    fn test_assign_outputs_tag_mismatch() {
        let mut args = CallArgs::new().output(&Reply { num: 0 }).unwrap();
        let err = args
            .assign_outputs(vec![TaggedValue::encode(&Args { a: 1, b: 2 }).unwrap()])
            .unwrap_err();
        assert!(err.to_string().contains("expected type"));
    }

    /// Drive the client against a hand-rolled peer codec.
    #[tokio::test]
    async fn test_call_completes_from_peer_response() {
        let (left, right) = duplex(16 * 1024);
        let client = Client::new(left);
        let peer = RpcCodec::new(right);

        let responder = tokio::spawn(async move {
            let mut req = Request::default();
            peer.read_request_header(&mut req).await.unwrap();
            let body = peer.read_body_bundle().await.unwrap();
            assert_eq!(req.method, "DummyService.Sum");
            assert_eq!(body.len(), 2);

            let resp = Response {
                kind: ResponseKind::Rpc,
                seq: req.seq,
                error: String::new(),
            };
            let outputs = vec![TaggedValue::encode(&Reply { num: 3 }).unwrap()];
            peer.write_response(&resp, Body::Bundle(&outputs))
                .await
                .unwrap();
        });

        let args = CallArgs::new()
            .input(&Args { a: 1, b: 2 })
            .unwrap()
            .output(&Reply { num: 100 })
            .unwrap();
        let call = client.call("DummyService.Sum", args).await.unwrap();
        assert_eq!(call.output::<Reply>(0).unwrap(), Reply { num: 3 });
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_fails_call() {
        let (left, right) = duplex(16 * 1024);
        let client = Client::new(left);
        let peer = RpcCodec::new(right);

        tokio::spawn(async move {
            let mut req = Request::default();
            peer.read_request_header(&mut req).await.unwrap();
            peer.read_body_discard().await.unwrap();

            let resp = Response {
                kind: ResponseKind::Rpc,
                seq: req.seq,
                error: "Test Error".to_string(),
            };
            peer.write_response(&resp, Body::None).await.unwrap();
        });

        let args = CallArgs::new().input(&Args { a: 1, b: 2 }).unwrap();
        let err = client.call("DummyService.Error", args).await.unwrap_err();
        assert_eq!(err.to_string(), "Test Error");
    }

    #[tokio::test]
    async fn test_seq_increases_per_call() {
        let (left, right) = duplex(16 * 1024);
        let client = Client::new(left);
        let peer = RpcCodec::new(right);

        let responder = tokio::spawn(async move {
            let mut seqs = Vec::new();
            for _ in 0..3 {
                let mut req = Request::default();
                peer.read_request_header(&mut req).await.unwrap();
                peer.read_body_discard().await.unwrap();
                seqs.push(req.seq);

                let resp = Response {
                    kind: ResponseKind::Rpc,
                    seq: req.seq,
                    error: String::new(),
                };
                peer.write_response(&resp, Body::Bundle(&[])).await.unwrap();
            }
            seqs
        });

        for _ in 0..3 {
            let args = CallArgs::new().input(&1i32).unwrap();
            client.call("Svc.Ping", args).await.unwrap();
        }
        assert_eq!(responder.await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_push_routed_to_subscriber() {
        let (left, right) = duplex(16 * 1024);
        let client = Client::new(left);
        let peer = RpcCodec::new(right);

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe_to_push::<PushData, _>(move |p| {
            let _ = tx.send(p.a + p.b);
        });

        let push = Response {
            kind: ResponseKind::Push,
            seq: 0,
            error: String::new(),
        };
        let value = TaggedValue::encode(&PushData { a: 1, b: 2 }).unwrap();
        peer.write_response(&push, Body::Single(&value))
            .await
            .unwrap();

        let sum = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sum, 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_later_calls() {
        let (left, _right) = duplex(16 * 1024);
        let client = Client::new(left);

        client.close().await.unwrap();
        assert!(matches!(client.close().await, Err(RpcError::Shutdown)));

        let args = CallArgs::new().input(&1i32).unwrap();
        let err = client.call("Svc.Ping", args).await.unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_pending_and_notifies() {
        let (left, right) = duplex(16 * 1024);
        let client = Client::new(left);
        let peer = RpcCodec::new(right);

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe_to_disconnect(move || {
            let _ = tx.send(());
        });

        // Start a call the peer will never answer.
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let args = CallArgs::new().input(&1i32).unwrap();
        client.go("Svc.Hang", args, done_tx).await;

        // Peer reads the request then goes away.
        let mut req = Request::default();
        peer.read_request_header(&mut req).await.unwrap();
        drop(peer);

        let call = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(call.error, Some(RpcError::UnexpectedEof)));

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("disconnect handler did not fire")
            .unwrap();
    }
}
