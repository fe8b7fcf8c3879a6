//! Outbound control envelopes.
//!
//! The feed accepts JSON objects of the form `{"a": action, "v": payload, "m": channel}`.

use serde::Serialize;

use crate::registry::SubscriptionRegistry;

pub const ACTION_SUBSCRIBE: &str = "subscribe";
pub const ACTION_HEARTBEAT: &str = "h";
pub const CHANNEL_MARKETDATA: &str = "marketdata";

/// One `(exchange_code, instrument_token)` pair, serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriptionPair(pub u8, pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    #[serde(rename = "a")]
    pub action: &'static str,
    #[serde(rename = "v")]
    pub payload: Vec<SubscriptionPair>,
    #[serde(rename = "m")]
    pub channel: &'static str,
}

impl Envelope {
    /// Subscribe to every instrument in the registry, in registry order.
    pub fn subscribe(registry: &SubscriptionRegistry) -> Self {
        Self {
            action: ACTION_SUBSCRIBE,
            payload: registry.subscription_pairs(),
            channel: CHANNEL_MARKETDATA,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            action: ACTION_HEARTBEAT,
            payload: Vec::new(),
            channel: "",
        }
    }

    pub fn to_json(&self) -> String {
        // Only integers and static strings: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
