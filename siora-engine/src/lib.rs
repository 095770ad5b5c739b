pub use async_trait::async_trait;

pub use conn::Conn;
pub use handler::EngineHandler;
pub use packet::{MessageType, Packet, PacketType};
pub use server::EngineServer;
pub use service::EngineService;
pub use sid::Sid;
pub use socket::{EmitData, Event, Socket};
pub use transport::TransportType;

pub mod config;
pub mod errors;
pub mod handler;
pub mod packet;
pub mod payload;
pub mod service;
pub mod sid;
pub mod socket;
pub mod transport;

pub mod body;

mod conn;
mod server;
mod session;
