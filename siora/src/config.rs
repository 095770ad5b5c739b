use std::time::Duration;

use siora_engine::config::EngineConfig;

/// The payload parser multiplexed sessions negotiate out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserKind {
    /// Textual header + JSON payload, binary attachments as follow-up frames.
    #[default]
    Default,
    /// The whole packet as a single MessagePack frame.
    MsgPack,
}

#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    /// Engine-level transport configuration (heartbeats, buffers, path).
    pub engine: EngineConfig,

    /// The packet parser used for every session of this server.
    pub parser: ParserKind,

    /// How long an `emit_with_ack` waits before yielding a timeout.
    /// Defaults to 5 seconds.
    pub ack_timeout: Duration,
}

impl Default for SocketIoConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            parser: ParserKind::default(),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

impl SocketIoConfig {
    pub fn builder() -> SocketIoConfigBuilder {
        SocketIoConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct SocketIoConfigBuilder {
    config: SocketIoConfig,
}

impl SocketIoConfigBuilder {
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    pub fn parser(mut self, parser: ParserKind) -> Self {
        self.config.parser = parser;
        self
    }

    pub fn ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.config.ack_timeout = ack_timeout;
        self
    }

    pub fn build(self) -> SocketIoConfig {
        self.config
    }
}
