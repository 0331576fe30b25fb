//! Ping plugin
//!
//! The simplest functional plugin: receives `kdeconnect.ping` packets and
//! counts them. Mostly useful for connectivity checks, so it accepts pings
//! from unpaired devices too.

use crate::plugins::{Plugin, PluginContext, PluginFactory};
use crate::{Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";

#[derive(Default)]
pub struct PingPlugin {
    received: u64,
    last_message: Option<String>,
}

impl PingPlugin {
    /// Build an outgoing ping, optionally with a display message
    pub fn ping_packet(message: Option<&str>) -> Packet {
        match message {
            Some(msg) => Packet::new(PACKET_TYPE_PING, json!({ "message": msg })),
            None => Packet::new(PACKET_TYPE_PING, json!({})),
        }
    }

    /// Send a ping to the bound device
    pub fn send_ping(&self, ctx: &PluginContext, message: Option<&str>) -> Result<()> {
        ctx.send_packet(Self::ping_packet(message))
    }

    pub fn received_count(&self) -> u64 {
        self.received
    }

    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn listens_to_unpaired(&self) -> bool {
        true
    }

    async fn handle_packet(&mut self, packet: &Packet, ctx: &PluginContext) -> Result<()> {
        self.received += 1;
        self.last_message = packet.string("message");

        info!(
            "Ping from {} ({} total){}",
            ctx.device_id(),
            self.received,
            self.last_message
                .as_deref()
                .map(|m| format!(": {}", m))
                .unwrap_or_default()
        );
        Ok(())
    }
}

pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin::default())
    }
}
