//! meek_mqtt — rumqttc adapter for the meek_core `CommandBus` port.
//!
//! One background task owns the rumqttc event loop: it feeds inbound
//! publishes into the priority message queue (broker callbacks never
//! block), resubscribes and republishes the retained controller status on
//! every reconnect, and backs off exponentially between connection
//! attempts up to a configurable cap.

mod client;

pub use client::{spawn_bus, MqttBus, MqttSettings};
