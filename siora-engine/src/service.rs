//! A tower [`Service`] exposing the engine over HTTP.
//!
//! Requests under the configured path are parsed and dispatched to the
//! appropriate transport; anything else is forwarded to the inner service
//! (a 404 responder by default, so the service also works standalone).

use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::future::{self, Ready};
use http::{Method, Request, Response, StatusCode};
use http_body::{Body, Empty};
use pin_project::pin_project;
use tower::Service;

use crate::{
    body::ResponseBody,
    config::EngineConfig,
    errors::Error,
    handler::EngineHandler,
    server::EngineServer,
    sid::Sid,
    transport::{polling::WireFormat, ws, ConnInfo, TransportType},
};

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("transport unknown")]
    UnknownTransport,
    #[error("bad handshake method")]
    BadHandshakeMethod,
    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,
    #[error("invalid jsonp index")]
    InvalidJsonpIndex,
}

/// Convert a parse error into the matching 400 response.
impl<B> From<ParseError> for Response<ResponseBody<B>> {
    fn from(err: ParseError) -> Self {
        use ParseError::*;
        let message = match err {
            UnknownTransport => "{\"code\":\"0\",\"message\":\"Transport unknown\"}",
            BadHandshakeMethod => "{\"code\":\"2\",\"message\":\"Bad handshake method\"}",
            UnsupportedProtocolVersion => {
                "{\"code\":\"5\",\"message\":\"Unsupported protocol version\"}"
            }
            InvalidJsonpIndex => "{\"code\":\"3\",\"message\":\"Bad request\"}",
        };
        Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .header("Content-Type", "application/json")
            .body(ResponseBody::custom_response(message))
            .unwrap()
    }
}

/// The protocol version this server speaks.
pub const PROTOCOL_VERSION: &str = "3";

/// The request information extracted from the URI query.
#[derive(Debug)]
pub(crate) struct RequestInfo {
    pub sid: Option<Sid>,
    pub transport: TransportType,
    pub method: Method,
    pub format: WireFormat,
}

impl RequestInfo {
    fn parse<B>(req: &Request<B>) -> Result<Self, ParseError> {
        use ParseError::*;
        let query = req.uri().query().ok_or(UnknownTransport)?;
        let param = |name: &str| {
            query
                .split('&')
                .find_map(|s| s.strip_prefix(name).and_then(|s| s.strip_prefix('=')))
        };

        if param("EIO") != Some(PROTOCOL_VERSION) {
            return Err(UnsupportedProtocolVersion);
        }

        let transport: TransportType = param("transport").ok_or(UnknownTransport)?.parse()?;
        let sid = param("sid").and_then(|s| Sid::from_str(s).ok());
        let format = match param("j") {
            Some(index) => WireFormat::Jsonp(index.parse().map_err(|_| InvalidJsonpIndex)?),
            None if param("b64") == Some("1") => WireFormat::Xhr,
            None => WireFormat::Xhr2,
        };

        let method = req.method().clone();
        if method == Method::POST && sid.is_none() {
            return Err(BadHandshakeMethod);
        }
        Ok(RequestInfo {
            sid,
            transport,
            method,
            format,
        })
    }
}

/// A [`Service`] handling engine requests as a middleware over `S`.
pub struct EngineService<H: EngineHandler, S = NotFoundService> {
    inner: S,
    engine: Arc<EngineServer<H>>,
}

impl<H: EngineHandler> EngineService<H, NotFoundService> {
    /// Standalone service answering 404 to non-engine requests.
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, EngineConfig::default())
    }

    pub fn with_config(handler: H, config: EngineConfig) -> Self {
        Self::with_config_inner(NotFoundService, handler, config)
    }
}

impl<H: EngineHandler, S> EngineService<H, S> {
    pub fn with_inner(inner: S, handler: H) -> Self {
        Self::with_config_inner(inner, handler, EngineConfig::default())
    }

    pub fn with_config_inner(inner: S, handler: H, config: EngineConfig) -> Self {
        Self {
            inner,
            engine: Arc::new(EngineServer::new(handler, config)),
        }
    }

    pub fn engine(&self) -> &Arc<EngineServer<H>> {
        &self.engine
    }
}

impl<H: EngineHandler, S: Clone> EngineService<H, S> {
    /// A MakeService yielding clones of this service, for hyper's server.
    pub fn into_make_service(self) -> MakeEngineService<H, S> {
        MakeEngineService { svc: self }
    }
}

impl<H: EngineHandler, S: Clone> Clone for EngineService<H, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<H: EngineHandler, S> std::fmt::Debug for EngineService<H, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineService").finish()
    }
}

impl<ReqBody, ResBody, S, H> Service<Request<ReqBody>> for EngineService<H, S>
where
    ReqBody: Body + Send + Unpin + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: std::fmt::Debug,
    ResBody: Body + Send + 'static,
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    H: EngineHandler,
{
    type Response = Response<ResponseBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if !req.uri().path().starts_with(&self.engine.config.req_path) {
            return ResponseFuture::inner(self.inner.call(req));
        }
        let info = match RequestInfo::parse(&req) {
            Ok(info) => info,
            Err(e) => return ResponseFuture::ready(e.into()),
        };
        let engine = self.engine.clone();
        match (info.transport, info.method, info.sid) {
            (TransportType::Polling, Method::GET, None) => {
                let peer = ConnInfo::from_parts(&req.into_parts().0);
                ResponseFuture::spawned(async move {
                    engine.open_polling_req(info.format, peer).await
                })
            }
            (TransportType::Polling, Method::GET, Some(sid)) => {
                ResponseFuture::spawned(async move { engine.polling_get(sid, info.format).await })
            }
            (TransportType::Polling, Method::POST, Some(sid)) => {
                let content_type = req
                    .headers()
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                ResponseFuture::spawned(async move {
                    let body = hyper::body::to_bytes(req.into_body()).await.map_err(|e| {
                        tracing::debug!("error aggregating request body: {:?}", e);
                        Error::HttpErrorResponse(StatusCode::BAD_REQUEST)
                    })?;
                    engine.polling_post(sid, content_type, body).await
                })
            }
            (TransportType::Websocket, Method::GET, sid) => {
                ResponseFuture::ready(match ws::serve(engine, sid, req) {
                    Ok(res) => res,
                    Err(e) => e.into(),
                })
            }
            _ => ResponseFuture::ready(
                Error::HttpErrorResponse(StatusCode::METHOD_NOT_ALLOWED).into(),
            ),
        }
    }
}

type BoxResponseFuture<B> =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody<B>>, Error>> + Send>>;

#[pin_project]
pub struct ResponseFuture<F, B> {
    #[pin]
    inner: ResponseFutureInner<F, B>,
}

#[pin_project(project = ResFutProj)]
enum ResponseFutureInner<F, B> {
    Inner {
        #[pin]
        future: F,
    },
    Ready {
        response: Option<Response<ResponseBody<B>>>,
    },
    Spawned {
        future: BoxResponseFuture<B>,
    },
}

impl<F, B> ResponseFuture<F, B> {
    fn inner(future: F) -> Self {
        Self {
            inner: ResponseFutureInner::Inner { future },
        }
    }

    fn ready(response: Response<ResponseBody<B>>) -> Self {
        Self {
            inner: ResponseFutureInner::Ready {
                response: Some(response),
            },
        }
    }

    fn spawned(
        future: impl Future<Output = Result<Response<ResponseBody<B>>, Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: ResponseFutureInner::Spawned {
                future: Box::pin(future),
            },
        }
    }
}

impl<ResBody, F, E> Future for ResponseFuture<F, ResBody>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ResponseBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let res = match self.project().inner.project() {
            ResFutProj::Inner { future } => match future.poll(cx) {
                Poll::Ready(res) => res?.map(ResponseBody::new),
                Poll::Pending => return Poll::Pending,
            },
            ResFutProj::Ready { response } => response.take().expect("future polled after ready"),
            ResFutProj::Spawned { future } => match future.as_mut().poll(cx) {
                Poll::Ready(res) => res.unwrap_or_else(Into::into),
                Poll::Pending => return Poll::Pending,
            },
        };
        Poll::Ready(Ok(res))
    }
}

pub struct MakeEngineService<H: EngineHandler, S: Clone> {
    svc: EngineService<H, S>,
}

impl<H: EngineHandler, S: Clone, T> Service<T> for MakeEngineService<H, S> {
    type Response = EngineService<H, S>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: T) -> Self::Future {
        future::ready(Ok(self.svc.clone()))
    }
}

/// A [`Service`] that always answers 404, compatible with [`EngineService`].
#[derive(Debug, Clone)]
pub struct NotFoundService;

impl<ReqBody> Service<Request<ReqBody>> for NotFoundService {
    type Response = Response<Empty<Bytes>>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: Request<ReqBody>) -> Self::Future {
        future::ready(Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Empty::new())
            .unwrap()))
    }
}
