use http::{Response, StatusCode};
use tokio_tungstenite::tungstenite;

use crate::{body::ResponseBody, packet::Packet};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid packet type digit")]
    InvalidPacketType,
    #[error("malformed payload length header")]
    InvalidPacketLength,
    #[error("payload truncated")]
    PayloadTruncated,
    #[error("payload bigger than the configured limit")]
    PayloadTooLarge,
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),
    #[error("error decoding base64 packet: {0:?}")]
    Base64(#[from] base64::DecodeError),
    #[error("packet is not valid utf-8: {0:?}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("bad packet received: {0:?}")]
    BadPacket(Packet),
    #[error("invalid event")]
    InvalidEvent,

    #[error("polling conn closed")]
    PollingConnClosed,
    #[error("conn paused")]
    ConnPaused,
    #[error("conn closed")]
    ConnClosed,
    #[error("a polling request is already open for this session")]
    MultiplePollingRequests,
    #[error("emitter closed")]
    EmitterClosed,
    #[error("packet buffer full")]
    BufferFull,
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("upgrade failed")]
    UpgradeFailed,

    #[error("unknown session id")]
    UnknownSession,
    #[error("transport mismatch")]
    TransportMismatch,
    #[error("invalid media type")]
    InvalidMediaType,
    #[error("invalid charset, expected utf-8")]
    InvalidCharset,

    #[error("ws transport error: {0:?}")]
    Ws(#[from] tungstenite::Error),
    #[error("http error: {0:?}")]
    Http(#[from] http::Error),
    #[error("http error response: {0:?}")]
    HttpErrorResponse(StatusCode),
}

impl Error {
    /// Benign terminal sentinel: the conn is gone, nothing else is wrong.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::PollingConnClosed | Error::ConnClosed)
    }

    fn status(&self) -> StatusCode {
        use Error::*;
        match self {
            PollingConnClosed | ConnClosed | ConnPaused => StatusCode::NOT_FOUND,
            UnknownSession
            | TransportMismatch
            | MultiplePollingRequests
            | InvalidMediaType
            | InvalidCharset
            | InvalidPacketType
            | InvalidPacketLength
            | PayloadTruncated
            | PayloadTooLarge
            | BadPacket(_) => StatusCode::BAD_REQUEST,
            HttpErrorResponse(code) => *code,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convert an error into an http response with the appropriate status code.
impl<B> From<Error> for Response<ResponseBody<B>> {
    fn from(err: Error) -> Self {
        let status = err.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::debug!("uncaught error {err:?}");
        }
        Response::builder()
            .status(status)
            .body(ResponseBody::empty_response())
            .unwrap()
    }
}
