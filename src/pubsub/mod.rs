//! Bounded per-account publish/subscribe broker
//!
//! Each channel is a broadcast queue keyed by account. Lifecycle components only
//! see `route` and `check_channel`; the WebSocket surface subscribes.

use crate::error::{EngineError, EngineResult};
use crate::tx::Transaction;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Per-cycle valuation of one escrow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateUpdate {
    pub account: String,
    pub escrow_condition: String,
    pub currency: String,
    pub issuer: String,
    pub ledger: u32,
    pub liquidation_call: Decimal,
    pub liquidation_base: Decimal,
    pub current_rate: Decimal,
    pub first_price: Decimal,
    pub slippage: Decimal,
    pub orders_crossed: usize,
    pub liquidate: bool,
}

/// Settlement confirmed on ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscrowClear {
    pub account: String,
    pub escrow_condition: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
}

/// Messages delivered to account channels
#[derive(Debug, Clone, Serialize)]
pub enum PubSubMessage {
    #[serde(rename = "RATE_UPDATE")]
    RateUpdate(RateUpdate),
    #[serde(rename = "ESCROW_CLEAR")]
    EscrowClear(EscrowClear),
    #[serde(rename = "ESCROW_CREATE")]
    EscrowCreate(Box<Transaction>),
    #[serde(rename = "PONG")]
    Pong(String),
}

/// Channel table with a fixed upper bound
pub struct Broker {
    channels: DashMap<String, broadcast::Sender<String>>,
    max_channels: usize,
    capacity: usize,
}

impl Broker {
    pub fn new(max_channels: usize, capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            max_channels,
            capacity: capacity.max(1),
        }
    }

    /// Join (creating if needed) the channel for `channel`
    pub fn subscribe(&self, channel: &str) -> EngineResult<broadcast::Receiver<String>> {
        if let Some(sender) = self.channels.get(channel) {
            return Ok(sender.subscribe());
        }

        if self.channels.len() >= self.max_channels {
            self.prune();
            if self.channels.len() >= self.max_channels {
                return Err(EngineError::Internal(format!(
                    "channel table full ({} channels)",
                    self.max_channels
                )));
            }
        }

        // Entry guard must drop before `len()` takes the shard locks
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        crate::metrics::set_pubsub_channels(self.channels.len());
        Ok(rx)
    }

    /// True only while a live subscriber exists
    pub fn check_channel(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .map_or(false, |sender| sender.receiver_count() > 0)
    }

    /// Publish to a channel; returns whether anyone received it
    pub fn route(&self, message: &PubSubMessage, channel: &str) -> bool {
        let sender = match self.channels.get(channel) {
            Some(sender) => sender.clone(),
            None => {
                debug!("No channel {}", channel);
                return false;
            }
        };

        let payload = json!({ channel: message }).to_string();
        match sender.send(payload) {
            Ok(receivers) => {
                debug!("Routed message to {} subscriber(s) of {}", receivers, channel);
                true
            }
            Err(_) => {
                self.channels.remove_if(channel, |_, s| s.receiver_count() == 0);
                false
            }
        }
    }

    /// Drop channels whose subscribers have all gone
    pub fn prune(&self) {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        let removed = before - self.channels.len();
        if removed > 0 {
            warn!("Pruned {} idle pub/sub channels", removed);
        }
        crate::metrics::set_pubsub_channels(self.channels.len());
    }
}
