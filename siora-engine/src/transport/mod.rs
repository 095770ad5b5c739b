//! The two transports a session can ride on, and their conn types.

use std::str::FromStr;

pub mod polling;
pub mod ws;

use crate::service::ParseError;

/// The transport named in the request query.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportType {
    Polling,
    Websocket,
}

impl FromStr for TransportType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportType::Polling),
            "websocket" => Ok(TransportType::Websocket),
            _ => Err(ParseError::UnknownTransport),
        }
    }
}

impl From<TransportType> for &'static str {
    fn from(t: TransportType) -> Self {
        match t {
            TransportType::Polling => "polling",
            TransportType::Websocket => "websocket",
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}

/// Peer identity captured when a conn is accepted.
#[derive(Debug, Clone, Default)]
pub struct ConnInfo {
    pub host: String,
    pub remote_addr: String,
}

impl ConnInfo {
    pub(crate) fn from_parts(parts: &http::request::Parts) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        ConnInfo {
            host: header("host"),
            remote_addr: header("x-forwarded-for"),
        }
    }
}
