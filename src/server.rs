//! Server engine: owns accepted connections and drives the request cycle.
//!
//! Each attached connection gets one read task. The read loop is strictly
//! sequential; every accepted request is dispatched on its own spawned task,
//! and response writes serialize on the codec's write lock. Recoverable
//! request errors (ill-formed or unknown method names, bad bundles) produce
//! header-only error responses bound to the offending seq; anything that
//! leaves the stream unreadable terminates the connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::codec::{Body, RpcCodec, TaggedValue, TypeTable};
use crate::context::ConnContext;
use crate::error::{Result, RpcError};
use crate::http;
use crate::protocol::{RecordCache, Request, Response, ResponseKind};
use crate::service::{MethodDescriptor, MethodOutcome, Registry, Service};

/// RPC server: a registry of services plus per-connection machinery.
pub struct Server {
    registry: Registry,
    types: TypeTable,
    cache: RecordCache,
    next_conn_id: AtomicU64,
}

impl Server {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            types: TypeTable::new(),
            cache: RecordCache::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a service under its own name.
    pub fn register(&self, service: Service) -> Result<()> {
        let installed = self.registry.register(service)?;
        installed.types().merge_into(&self.types);
        Ok(())
    }

    /// Register a service under an explicit name.
    pub fn register_with_name(&self, service: Service, name: &str) -> Result<()> {
        let installed = self.registry.register_with_name(service, name)?;
        installed.types().merge_into(&self.types);
        Ok(())
    }

    /// The server's registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Take ownership of an established duplex stream and serve it.
    ///
    /// Spawns the connection read loop and returns a handle that can push
    /// events to the peer or close the connection.
    pub fn attach<S>(self: &Arc<Self>, stream: S, peer: Option<SocketAddr>) -> ServerConn
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = Arc::new(RpcCodec::new(stream));
        self.types.merge_into(codec.types());

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let ctx = ConnContext::new(conn_id, peer);

        let server = self.clone();
        let loop_codec = codec.clone();
        let loop_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            server.connection_loop(loop_codec, loop_ctx).await;
        });

        ServerConn { codec, ctx, task }
    }

    /// Accept raw TCP connections and serve each one.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let _conn = self.attach(stream, Some(peer));
        }
    }

    /// Accept TCP connections, run the HTTP `CONNECT` handshake on `path`,
    /// then serve each upgraded stream.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener, path: &str) -> Result<()> {
        loop {
            let (mut stream, peer) = listener.accept().await?;
            let server = self.clone();
            let path = path.to_string();
            tokio::spawn(async move {
                match http::accept_connect(&mut stream, &path).await {
                    Ok(()) => {
                        let _conn = server.attach(stream, Some(peer));
                    }
                    Err(e) => tracing::debug!("rpc hijacking {}: {}", peer, e),
                }
            });
        }
    }

    async fn connection_loop(self: Arc<Self>, codec: Arc<RpcCodec>, ctx: ConnContext) {
        while self.process_one(&codec, &ctx).await {}
        ctx.scope().cancel();
        tracing::debug!(conn_id = ctx.conn_id(), "connection terminated");
    }

    /// Handle one request. Returns false once the connection is done.
    async fn process_one(self: &Arc<Self>, codec: &Arc<RpcCodec>, ctx: &ConnContext) -> bool {
        let mut req = self.cache.get_request();

        let read = tokio::select! {
            r = codec.read_request_header(&mut req) => r,
            _ = ctx.cancelled() => Err(RpcError::Shutdown),
        };
        if let Err(e) = read {
            self.cache.put_request(req);
            match e {
                RpcError::Eof | RpcError::Shutdown => {}
                other => tracing::debug!("server cannot decode request: {}", other),
            }
            return false;
        }

        let (service, method) = match self.resolve(&req.method) {
            Ok(found) => found,
            Err(msg) => {
                // The header was readable, so a body frame follows; drain it
                // before answering.
                if codec.read_body_discard().await.is_err() {
                    self.cache.put_request(req);
                    return false;
                }
                self.send_error(codec, req, msg).await;
                return true;
            }
        };

        let args = match codec.read_body_bundle().await {
            Ok(args) => args,
            Err(e) if e.is_terminal() => {
                self.cache.put_request(req);
                return false;
            }
            Err(e) => {
                self.send_error(codec, req, format!("server cannot decode request body: {e}"))
                    .await;
                return true;
            }
        };

        let expected = method.args().len();
        if args.len() != expected {
            self.send_error(
                codec,
                req,
                format!("Mismatch in the number of arguments! Expected {expected}"),
            )
            .await;
            return true;
        }

        let server = self.clone();
        let codec = codec.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let outcome = service.execute_method(&method, ctx, args).await;
            server.send_response(&codec, req, outcome).await;
        });
        true
    }

    fn resolve(&self, method: &str) -> std::result::Result<(Arc<Service>, Arc<MethodDescriptor>), String> {
        let dot = method
            .rfind('.')
            .ok_or_else(|| format!("service/method request ill-formed: {method}"))?;
        let service_name = &method[..dot];
        let method_name = &method[dot + 1..];

        let (service, descriptor) = self.registry.get_service_method(service_name, method_name);
        let service = service.ok_or_else(|| format!("Can't find service {service_name}"))?;
        let descriptor = descriptor
            .ok_or_else(|| format!("Can't find method {method_name} for service {service_name}"))?;
        Ok((service, descriptor))
    }

    async fn send_error(&self, codec: &RpcCodec, req: Request, message: String) {
        self.send_response(codec, req, MethodOutcome::fail(message))
            .await;
    }

    /// Write the response for `req` and recycle both header records.
    async fn send_response(&self, codec: &RpcCodec, req: Request, outcome: MethodOutcome) {
        let mut resp = self.cache.get_response();
        resp.kind = ResponseKind::Rpc;
        resp.seq = req.seq;

        let written = match outcome.error {
            Some(message) => {
                resp.error = message;
                codec.write_response(&resp, Body::None).await
            }
            None => codec.write_response(&resp, Body::Bundle(&outcome.outputs)).await,
        };

        self.cache.put_request(req);
        self.cache.put_response(resp);

        if let Err(e) = written {
            tracing::error!("writing response: {}", e);
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one attached connection.
pub struct ServerConn {
    codec: Arc<RpcCodec>,
    ctx: ConnContext,
    task: JoinHandle<()>,
}

impl ServerConn {
    /// The connection's context.
    pub fn context(&self) -> &ConnContext {
        &self.ctx
    }

    /// Push an unsolicited typed event to the client.
    ///
    /// Routed on the client by the value's type; not correlated with any
    /// request.
    pub async fn push<T: Serialize>(&self, value: &T) -> Result<()> {
        let header = Response {
            kind: ResponseKind::Push,
            seq: 0,
            error: String::new(),
        };
        let tagged = TaggedValue::encode(value)?;
        self.codec.write_response(&header, Body::Single(&tagged)).await
    }

    /// Cancel the connection scope and close the stream.
    pub async fn close(&self) -> Result<()> {
        self.ctx.scope().cancel();
        self.codec.close().await
    }

    /// Wait for the read loop to finish.
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}
