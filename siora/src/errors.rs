use siora_engine::Sid;
use tokio::sync::oneshot;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("error encoding msgpack packet: {0:?}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("error decoding msgpack packet: {0:?}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("invalid packet type")]
    InvalidPacketType,

    #[error("unknown packet")]
    UnknownPacket,

    #[error("invalid event name")]
    InvalidEventName,

    #[error("binary frame received outside of a binary packet")]
    UnexpectedBinaryFrame,

    #[error("text frame received while binary attachments were pending")]
    IncompleteBinaryPacket,

    #[error("cannot find socket: {0}")]
    SocketGone(Sid),

    #[error("error packet received from the peer: {0}")]
    Peer(serde_json::Value),

    #[error("engine error: {0}")]
    Engine(#[from] siora_engine::errors::Error),
}

/// Error type for ack round-trips.
#[derive(thiserror::Error, Debug)]
pub enum AckError {
    /// The ack response never arrived, the peer namespace was detached.
    #[error("ack receive error")]
    Recv(#[from] oneshot::error::RecvError),

    /// The ack response did not arrive in time.
    #[error("ack timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// The event packet could not be sent in the first place.
    #[error("send error: {0}")]
    Send(#[from] Error),
}

impl From<serde_json::Error> for AckError {
    fn from(err: serde_json::Error) -> Self {
        AckError::Send(Error::Serialize(err))
    }
}
