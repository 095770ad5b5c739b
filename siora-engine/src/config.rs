use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The path to listen for engine.io requests on.
    /// Defaults to "/engine.io".
    pub req_path: String,

    /// The interval at which the server will send a ping packet to the client.
    /// Defaults to 25 seconds.
    pub ping_interval: Duration,

    /// The amount of time the server will wait for a pong response from the
    /// client before closing the session.
    /// Defaults to 20 seconds.
    pub ping_timeout: Duration,

    /// Deadline applied to each step of the transport upgrade handshake.
    ///
    /// Kept separate from the session read timeout so that a slow upgrade
    /// candidate cannot stall the paused session for a whole heartbeat cycle.
    /// Defaults to 5 seconds.
    pub upgrade_timeout: Duration,

    /// The number of outbound packets a polling conn will buffer between two
    /// polling requests before `WritePacket` blocks.
    /// Defaults to 8 packets.
    pub polling_buffer: usize,

    /// The maximum number of packets buffered in the session emitter queue.
    /// Defaults to 128 packets.
    pub max_buffer_size: usize,

    /// The maximum number of bytes accepted per http request body.
    /// Defaults to 100kb.
    pub max_payload: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            req_path: "/engine.io".to_string(),
            ping_interval: Duration::from_millis(25000),
            ping_timeout: Duration::from_millis(20000),
            upgrade_timeout: Duration::from_millis(5000),
            polling_buffer: 8,
            max_buffer_size: 128,
            max_payload: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// The path to listen for engine.io requests on.
    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.config.req_path = req_path.into();
        self
    }

    /// The interval at which the server will send a ping packet to the client.
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.config.ping_interval = ping_interval;
        self
    }

    /// The amount of time the server will wait for a pong response from the
    /// client before closing the session.
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.config.ping_timeout = ping_timeout;
        self
    }

    /// Deadline applied to each step of the transport upgrade handshake.
    pub fn upgrade_timeout(mut self, upgrade_timeout: Duration) -> Self {
        self.config.upgrade_timeout = upgrade_timeout;
        self
    }

    /// The number of outbound packets a polling conn will buffer between two
    /// polling requests.
    pub fn polling_buffer(mut self, polling_buffer: usize) -> Self {
        self.config.polling_buffer = polling_buffer;
        self
    }

    /// The maximum number of packets buffered in the session emitter queue.
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.config.max_buffer_size = max_buffer_size;
        self
    }

    /// The maximum number of bytes accepted per http request body.
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
