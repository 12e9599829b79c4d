use std::time::Duration;

use crate::{cli::BrokerArgs, connection::Topic, handshake::HandshakeLimits};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings for a [`crate::broker::Broker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub handshake: HandshakeLimits,
    /// Bound on one write to one subscriber; slower subscribers are dropped.
    pub write_timeout: Duration,
    /// Topic every admitted connection joins.
    pub topic: Topic,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeLimits::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            topic: Topic::default(),
        }
    }
}

impl From<&BrokerArgs> for BrokerConfig {
    fn from(args: &BrokerArgs) -> Self {
        Self {
            handshake: HandshakeLimits {
                max_frame_bytes: args.max_handshake_bytes,
                timeout: Duration::from_millis(args.handshake_timeout_ms),
            },
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            topic: Topic::default(),
        }
    }
}
