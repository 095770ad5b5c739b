pub use config::{ParserKind, SocketIoConfig};
pub use siora_engine::Sid;
pub use errors::{AckError, Error};
pub use ns::{AckResponse, Namespace};
pub use server::{Server, SocketIoService};
pub use socket::Socket;

pub mod config;
pub mod errors;
pub mod ns;
pub mod packet;
pub mod parser;
pub mod socket;

mod client;
mod server;
