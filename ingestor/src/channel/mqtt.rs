//! MQTT-backed channel.
//!
//! Readings are published with QoS 1 to `<topic>/<device id>`, and a send
//! completes only once the broker returned the PUBACK for it. Consumers use
//! persistent sessions with manual acknowledgements and subscribe through a
//! shared subscription (`$share/<group>/<topic>/+`), which makes the broker
//! hand each message to exactly one session of the group. A PUBACK is only
//! sent for messages the worker acknowledged, so the broker redelivers the
//! rest after a reconnect.
//!
//! Both sides drive their rumqttc event loop in a background task, so
//! keep-alives and acknowledgements flow while the caller is busy.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ChannelConsumer, ChannelProducer, Delivery, Receipt};
use crate::errors::{Error, Result};

const REQUEST_CAPACITY: usize = 10000;
const DELIVERY_CAPACITY: usize = 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.broker, self.port);
        options.set_keep_alive(self.keep_alive);
        options
    }
}

type AckWaiter = oneshot::Sender<Result<()>>;

/// Publishes waiting for their PUBACK.
///
/// rumqttc hands publish requests to the network in the order they were
/// queued, so `queued` lines up with the `Outgoing::Publish` events; from
/// then on the packet id identifies the waiter. Failed waiters leave a `None`
/// behind so retransmissions after a reconnect still line up.
#[derive(Default)]
struct Inflight {
    queued: VecDeque<Option<AckWaiter>>,
    sent: HashMap<u16, Option<AckWaiter>>,
}

impl Inflight {
    fn on_outgoing(&mut self, pkid: u16) {
        if self.sent.contains_key(&pkid) {
            // retransmission
            return;
        }
        if let Some(waiter) = self.queued.pop_front() {
            self.sent.insert(pkid, waiter);
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(Some(waiter)) = self.sent.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let waiters = self
            .queued
            .iter_mut()
            .chain(self.sent.values_mut())
            .filter_map(Option::take);
        for waiter in waiters {
            let _ = waiter.send(Err(Error::ChannelUnavailable(reason.to_string())));
        }
    }
}

pub struct MqttProducer {
    client: AsyncClient,
    topic: String,
    connected: Arc<AtomicBool>,
    inflight: Arc<Mutex<Inflight>>,
    send_timeout: Duration,
    driver: JoinHandle<()>,
}

impl MqttProducer {
    /// Starts the connection in the background; `send` fails fast until the
    /// broker acknowledged the connection.
    pub fn connect(settings: &MqttSettings, send_timeout: Duration) -> Self {
        info!(
            "Connecting producer to MQTT broker at {}:{}",
            settings.broker, settings.port
        );
        let mut options = settings.options();
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let driver = tokio::spawn(drive_producer(
            eventloop,
            connected.clone(),
            inflight.clone(),
        ));

        Self {
            client,
            topic: settings.topic.clone(),
            connected,
            inflight,
            send_timeout,
            driver,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

async fn drive_producer(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    inflight: Arc<Mutex<Inflight>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Producer connected to MQTT broker");
                connected.store(true, Ordering::Relaxed);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => inflight.lock().on_outgoing(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => inflight.lock().on_puback(ack.pkid),
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::Relaxed) {
                    error!("Producer lost MQTT connection: {}", e);
                } else {
                    debug!("Producer MQTT connection attempt failed: {}", e);
                }
                inflight.lock().fail_all(&e.to_string());
                // rumqttc reconnects on the next poll
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

impl Drop for MqttProducer {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl ChannelProducer for MqttProducer {
    async fn send(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ChannelUnavailable(
                "MQTT broker unreachable".to_string(),
            ));
        }
        let topic = format!("{}/{}", self.topic, key);
        let (tx, rx) = oneshot::channel();
        {
            // Held across try_publish so waiters queue in request order.
            let mut inflight = self.inflight.lock();
            inflight.queued.push_back(Some(tx));
            if let Err(e) = self
                .client
                .try_publish(topic, QoS::AtLeastOnce, false, payload)
            {
                inflight.queued.pop_back();
                return Err(Error::Mqtt(e));
            }
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelUnavailable(
                "MQTT producer stopped".to_string(),
            )),
            Err(_) => Err(Error::ChannelUnavailable(format!(
                "no PUBACK within {:?}",
                self.send_timeout
            ))),
        }
    }
}

pub struct MqttConsumer {
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    filter: String,
    deliveries: Option<mpsc::Receiver<Publish>>,
    redeliver: VecDeque<Publish>,
    driver: Option<JoinHandle<()>>,
}

impl MqttConsumer {
    pub fn new(settings: &MqttSettings, group: &str) -> Self {
        let mut options = settings.options();
        options.set_clean_session(false);
        options.set_manual_acks(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            eventloop: Some(eventloop),
            filter: format!("$share/{}/{}/+", group, settings.topic),
            deliveries: None,
            redeliver: VecDeque::new(),
            driver: None,
        }
    }
}

impl Drop for MqttConsumer {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}

async fn drive_consumer(
    mut eventloop: EventLoop,
    client: AsyncClient,
    filter: String,
    deliveries: mpsc::Sender<Publish>,
) {
    let mut connected_once = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                if deliveries.send(publish).await.is_err() {
                    debug!("Consumer dropped, stopping MQTT event loop");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Consumer connected to MQTT broker");
                // The first subscribe is already queued.
                if connected_once && !ack.session_present {
                    // Broker dropped our session; the subscription went with it.
                    warn!("MQTT session not present, resubscribing to {}", filter);
                    if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
                        error!("Failed to resubscribe to {}: {}", filter, e);
                    }
                }
                connected_once = true;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Consumer MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn key_from_topic(topic: &str) -> String {
    topic.rsplit('/').next().unwrap_or_default().to_string()
}

fn to_delivery(publish: Publish) -> Delivery {
    Delivery {
        key: key_from_topic(&publish.topic),
        payload: publish.payload.to_vec(),
        receipt: Receipt::Mqtt(Box::new(publish)),
    }
}

#[async_trait]
impl ChannelConsumer for MqttConsumer {
    async fn subscribe(&mut self) -> Result<()> {
        let Some(eventloop) = self.eventloop.take() else {
            return Ok(());
        };
        if let Err(e) = self.client.subscribe(&self.filter, QoS::AtLeastOnce).await {
            self.eventloop = Some(eventloop);
            return Err(Error::Mqtt(e));
        }

        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        self.deliveries = Some(rx);
        self.driver = Some(tokio::spawn(drive_consumer(
            eventloop,
            self.client.clone(),
            self.filter.clone(),
            tx,
        )));
        info!("Subscribed to {} with QoS 1", self.filter);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Delivery> {
        if let Some(publish) = self.redeliver.pop_front() {
            return Ok(to_delivery(publish));
        }
        let deliveries = self
            .deliveries
            .as_mut()
            .ok_or_else(|| Error::ChannelUnavailable("consumer is not subscribed".to_string()))?;
        deliveries.recv().await.map(to_delivery).ok_or(Error::ChannelClosed)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let Receipt::Mqtt(publish) = &delivery.receipt else {
            return Err(Error::ChannelUnavailable(
                "delivery does not belong to this broker".to_string(),
            ));
        };
        self.client.ack(publish).await.map_err(Error::Mqtt)
    }

    async fn release(&mut self, delivery: Delivery) -> Result<()> {
        let Receipt::Mqtt(publish) = delivery.receipt else {
            return Err(Error::ChannelUnavailable(
                "delivery does not belong to this broker".to_string(),
            ));
        };
        self.redeliver.push_front(*publish);
        Ok(())
    }
}
