//! The server facade: callback registration plus a tower [`Service`] that
//! plugs into any hyper/tower stack.

use std::{
    sync::Arc,
    task::{Context, Poll},
};

use http::{Request, Response};
use http_body::Body;
use siora_engine::{
    body::ResponseBody,
    service::{EngineService, NotFoundService, ResponseFuture},
    EngineServer, Sid,
};
use tower::{BoxError, Service};

use crate::{client::Client, config::SocketIoConfig, socket::Socket};

/// A Socket.IO server. Register the connection and error callbacks here,
/// serve the paired [`SocketIoService`].
pub struct Server {
    client: Arc<Client>,
    engine: Arc<EngineServer<Arc<Client>>>,
}

impl Server {
    pub fn new() -> (Server, SocketIoService) {
        Self::with_config(SocketIoConfig::default())
    }

    pub fn with_config(config: SocketIoConfig) -> (Server, SocketIoService) {
        let config = Arc::new(config);
        let client = Arc::new(Client::new(config.clone()));
        let svc = EngineService::with_config(client.clone(), config.engine.clone());
        let engine = svc.engine().clone();
        (Server { client, engine }, SocketIoService { inner: svc })
    }

    /// Like [`Server::with_config`], forwarding non-engine requests to
    /// `inner` instead of answering 404.
    pub fn with_inner<S: Clone>(config: SocketIoConfig, inner: S) -> (Server, SocketIoService<S>) {
        let config = Arc::new(config);
        let client = Arc::new(Client::new(config.clone()));
        let svc =
            EngineService::with_config_inner(inner, client.clone(), config.engine.clone());
        let engine = svc.engine().clone();
        (Server { client, engine }, SocketIoService { inner: svc })
    }

    /// Callback invoked for every new connection; returning an error routes
    /// it to the error callback.
    pub fn on_connect<C>(&self, callback: C)
    where
        C: Fn(Arc<Socket>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.client.set_on_connect(Box::new(callback));
    }

    /// Callback invoked for non-fatal errors: codec errors, failing event
    /// handlers, error packets from the peer.
    pub fn on_error<C>(&self, callback: C)
    where
        C: Fn(Arc<Socket>, BoxError) + Send + Sync + 'static,
    {
        self.client.set_on_error(Box::new(callback));
    }

    pub fn get_socket(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.client.get_socket(sid)
    }

    pub fn socket_count(&self) -> usize {
        self.client.socket_count()
    }

    /// Close every live session.
    pub fn close(&self) {
        self.engine.close();
    }
}

/// Tower [`Service`] answering the engine HTTP endpoint and feeding decoded
/// packets into the Socket.IO layer.
pub struct SocketIoService<S = NotFoundService> {
    inner: EngineService<Arc<Client>, S>,
}

impl<S: Clone> Clone for SocketIoService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> std::fmt::Debug for SocketIoService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketIoService").finish()
    }
}

impl<ReqBody, ResBody, S> Service<Request<ReqBody>> for SocketIoService<S>
where
    ReqBody: Body + Send + Unpin + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: std::fmt::Debug,
    ResBody: Body + Send + 'static,
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = Response<ResponseBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        self.inner.call(req)
    }
}

impl<S: Clone> SocketIoService<S> {
    /// A MakeService yielding clones of this service, for hyper's server.
    pub fn into_make_service(self) -> MakeSocketIoService<S> {
        MakeSocketIoService { svc: self }
    }
}

pub struct MakeSocketIoService<S: Clone> {
    svc: SocketIoService<S>,
}

impl<S: Clone, T> Service<T> for MakeSocketIoService<S> {
    type Response = SocketIoService<S>;
    type Error = std::convert::Infallible;
    type Future = futures::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: T) -> Self::Future {
        futures::future::ready(Ok(self.svc.clone()))
    }
}
