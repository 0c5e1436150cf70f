//! UI notification sink
//!
//! Connection events are republished to subscribed UI clients over MQTT:
//! - `<prefix>/connect` - a device session came up (payload `connect`)
//! - `<prefix>/disconnect` - a device session went down (payload `disconnect`)
//!
//! Publishing is fire-and-forget. Producers push into a bounded channel with
//! `try_send` so a slow broker never stalls device I/O; overflow is dropped.

use crate::infra::config::NotifierConfig;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Named UI events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    Connect,
    Disconnect,
}

impl UiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UiEvent::Connect => "connect",
            UiEvent::Disconnect => "disconnect",
        }
    }
}

/// Sink accepting named UI events
pub trait UiNotifier: Send + Sync {
    fn notify(&self, event: UiEvent);
}

/// Cloneable, non-blocking handle feeding the MQTT publisher
#[derive(Clone)]
pub struct NotifySender {
    tx: mpsc::Sender<UiEvent>,
}

impl UiNotifier for NotifySender {
    fn notify(&self, event: UiEvent) {
        if self.tx.try_send(event).is_err() {
            debug!(event = event.name(), "ui_notify_dropped");
        }
    }
}

/// Create a notification channel pair
pub fn create_notify_channel(buffer_size: usize) -> (NotifySender, mpsc::Receiver<UiEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (NotifySender { tx }, rx)
}

/// Used when the notifier is disabled in config
pub struct DisabledNotifier;

impl UiNotifier for DisabledNotifier {
    fn notify(&self, event: UiEvent) {
        debug!(event = event.name(), "ui_notify_disabled");
    }
}

/// Topic for an event under the configured prefix
pub fn topic_for(prefix: &str, event: UiEvent) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), event.name())
}

/// MQTT publisher actor draining the notification channel
pub struct MqttNotifier {
    client: AsyncClient,
    rx: mpsc::Receiver<UiEvent>,
    topic_prefix: String,
}

impl MqttNotifier {
    pub fn new(config: &NotifierConfig, rx: mpsc::Receiver<UiEvent>) -> Self {
        let client_id = format!("parking-relay-ui-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("ui_notifier_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "ui_notifier_mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic_prefix: config.topic_prefix.clone() }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.topic_prefix, "ui_notifier_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ui_notifier_shutdown");
                        return;
                    }
                }
                event = self.rx.recv() => {
                    let Some(event) = event else { return };
                    self.publish(event).await;
                }
            }
        }
    }

    async fn publish(&self, event: UiEvent) {
        let topic = topic_for(&self.topic_prefix, event);
        if let Err(e) =
            self.client.publish(&topic, QoS::AtMostOnce, false, event.name().as_bytes()).await
        {
            debug!(error = %e, topic = %topic, "ui_notify_publish_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_for() {
        assert_eq!(topic_for("/subscribe", UiEvent::Connect), "/subscribe/connect");
        assert_eq!(topic_for("/subscribe/", UiEvent::Disconnect), "/subscribe/disconnect");
    }

    #[tokio::test]
    async fn test_notify_sender_delivers_in_order() {
        let (sender, mut rx) = create_notify_channel(4);
        sender.notify(UiEvent::Connect);
        sender.notify(UiEvent::Disconnect);
        assert_eq!(rx.recv().await, Some(UiEvent::Connect));
        assert_eq!(rx.recv().await, Some(UiEvent::Disconnect));
    }

    #[tokio::test]
    async fn test_notify_sender_drops_when_full() {
        let (sender, mut rx) = create_notify_channel(1);
        sender.notify(UiEvent::Connect);
        sender.notify(UiEvent::Disconnect);
        assert_eq!(rx.recv().await, Some(UiEvent::Connect));
        assert!(rx.try_recv().is_err());
    }
}
