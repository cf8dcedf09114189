//! MQTT transport.
//!
//! Connects to the broker the openWB instance publishes to, forwards
//! incoming publishes over a channel and tracks the active
//! subscription set. Sessions start clean, so every `ConnAck` replays
//! the tracked set; a broker restart therefore cannot silently strand
//! the client without subscriptions. Topics are reference-counted:
//! two devices sharing an address (e.g. one charge template) each hold
//! a count, and the broker-level unsubscribe happens only when the
//! last holder lets go.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, SubscribeFilter};
use tokio::sync::mpsc;

use crate::config::MqttConfig;

/// One inbound publish, payload already decoded as UTF-8.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// Reference-counted subscription bookkeeping. `add`/`remove` report
/// whether the broker actually needs to hear about the change, which
/// makes repeated subscribe/unsubscribe calls for the same topic
/// harmless and keeps shared topics alive until their last user is
/// gone.
#[derive(Default)]
pub struct TopicSet {
    topics: DashMap<String, usize>,
}

impl TopicSet {
    /// Returns true when this is the first holder of the topic.
    pub fn add(&self, topic: &str) -> bool {
        let mut count = self.topics.entry(topic.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the last holder of the topic is gone.
    pub fn remove(&self, topic: &str) -> bool {
        if let Some(mut count) = self.topics.get_mut(topic) {
            if *count > 1 {
                *count -= 1;
                return false;
            }
        } else {
            return false;
        }
        self.topics.remove(topic);
        true
    }

    /// Current topic list, for replaying subscriptions on reconnect.
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<TopicSet>,
}

impl MqttTransport {
    /// Connect and spawn the event loop. Incoming publishes arrive on
    /// the returned receiver; connection errors are logged and retried
    /// with a short backoff, and every (re)connect replays the tracked
    /// subscription set.
    pub fn connect(config: &MqttConfig) -> (MqttTransport, mpsc::UnboundedReceiver<MqttMessage>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::unbounded_channel();

        let subscriptions = Arc::new(TopicSet::default());
        let replay_subscriptions = subscriptions.clone();
        let replay_client = client.clone();

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        tracing::debug!("MQTT <- {} = {}", publish.topic, payload);
                        if tx
                            .send(MqttMessage { topic: publish.topic.clone(), payload })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // Clean session: the broker forgot us, replay
                        // everything we track. One batched request so
                        // this task never blocks on its own channel.
                        let topics = replay_subscriptions.topics();
                        tracing::info!(
                            "MQTT connected, replaying {} subscriptions",
                            topics.len()
                        );
                        if !topics.is_empty() {
                            let filters: Vec<SubscribeFilter> = topics
                                .into_iter()
                                .map(|t| SubscribeFilter::new(t, QoS::AtLeastOnce))
                                .collect();
                            if let Err(e) = replay_client.try_subscribe_many(filters) {
                                tracing::warn!("MQTT subscription replay failed: {}", e);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT connection error, retrying: {}", e);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        (MqttTransport { client, subscriptions }, rx)
    }

    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        if self.subscriptions.add(topic) {
            tracing::debug!("MQTT subscribe {}", topic);
            self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        if self.subscriptions.remove(topic) {
            tracing::debug!("MQTT unsubscribe {}", topic);
            self.client.unsubscribe(topic).await?;
        }
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> anyhow::Result<()> {
        tracing::debug!("MQTT -> {} = {}", topic, payload);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes())
            .await?;
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
