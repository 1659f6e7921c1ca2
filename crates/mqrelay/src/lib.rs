//! mqrelay: synchronous request/response over a publish/subscribe bus.
//!
//! A requester publishes a named blob on its private upload topic and blocks
//! (with a bound) until the relay worker answers on the matching download
//! topic. See [`correlation`] for how replies find their requester.

mod version;

pub mod bridge;
pub mod bus;
pub mod config;
pub mod correlation;
pub mod identity;
pub mod relay;
pub mod topic;
pub mod transport;

pub use bridge::{Envelope, FrameError};
pub use bus::{
    ChannelHandler, InMemoryBroker, InboundMessage, MessageHandler, MqttTransport, Transport,
    TransportError,
};
pub use config::{BrokerConfig, ConfigError, RelayConfig};
pub use correlation::{CorrelationError, CorrelationWaiter, ReplyInbox, ReplyRecord};
pub use identity::{Identity, IdentityError};
pub use relay::{Relay, RelayError, Transform, Uppercase};
pub use topic::{Category, TopicError, TopicLayout};
pub use version::{MQRELAY_VERSION, VersionInfo};
