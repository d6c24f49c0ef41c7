/*! Connection configuration with builder and defaults. */

use std::time::Duration;

/** Tunables shared by every connection opened through [`crate::client`] */
#[derive(Debug, Clone)]
pub struct Config {
    /** Deadline for a reply, measured from the moment the command is written */
    pub reply_timeout: Duration,

    /** Deadline for the TCP connect (and TLS handshake) */
    pub connect_timeout: Duration,

    /** Initial capacity of the per-connection read buffer */
    pub read_buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
            read_buffer_capacity: 4 * 1024,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /** Values below 64 bytes are raised to 64 */
    pub fn read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.read_buffer_capacity = capacity.max(64);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
