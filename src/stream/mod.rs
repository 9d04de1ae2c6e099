//! Stream Module
//!
//! Server-push transport: SSE decoding, per-topic channels with reconnect
//! supervision, and a broker that lets consumers share one channel per topic.

pub mod sse;
pub mod channel;
pub mod reconnect;
pub mod broker;

pub use sse::{SseDecoder, SseFrame};
pub use channel::{pump_events, ChannelHandle, ChannelStats, DispatchOutcome, EventHandlers, StreamChannel};
pub use reconnect::ReconnectPolicy;
pub use broker::{BrokerSubscription, ChannelEvent, SubscriptionBroker, SubscriptionStream};
