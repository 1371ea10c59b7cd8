//! MQTT v5 binding of `JobQueue`.
//!
//! Queues are topics. The input topic is subscribed at QoS 1 with manual
//! acknowledgement and `receive_maximum = 1`, so the broker holds back the
//! next job until the current one is acked. A persistent session
//! (`clean_start = false`) keeps unacked jobs across reconnects.
//!
//! The rumqttc connection is driven on its own thread, which forwards what
//! the queue needs over a channel.

use std::collections::{HashMap, VecDeque};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rumqttc::v5::mqttbytes::v5::{ConnectProperties, PubAckReason, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::Outgoing;

use super::queue::{Delivery, JobQueue};
use super::tls::{build_transport, MqttEndpoint, TlsMaterials};
use crate::error::JobError;

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub input_queue: String,
    /// Shared subscription group, for competing consumers.
    pub share_group: Option<String>,
    pub keep_alive: Duration,
    /// How long the broker keeps the session (and unacked jobs) after a drop.
    pub session_expiry: Duration,
    /// Upper bound on waiting for a PUBACK.
    pub publish_timeout: Duration,
}

impl MqttSettings {
    pub fn subscription_filter(&self) -> String {
        match &self.share_group {
            Some(group) => format!("$share/{}/{}", group, self.input_queue),
            None => self.input_queue.clone(),
        }
    }

    /// Check that the broker transport can be built from the TLS material.
    pub fn validate(&self) -> Result<()> {
        build_transport(&self.endpoint, &self.tls).map(|_| ())
    }

    fn options(&self) -> Result<MqttOptions> {
        let endpoint = &self.endpoint;
        let mut options = MqttOptions::new(&self.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_start(false);
        // Replaces the whole property set, so prefetch is set here too.
        options.set_connect_properties(ConnectProperties {
            session_expiry_interval: Some(
                u32::try_from(self.session_expiry.as_secs()).unwrap_or(u32::MAX),
            ),
            receive_maximum: Some(1),
            ..ConnectProperties::new()
        });
        options.set_manual_acks(true);
        if let Some(user) = &self.username {
            options.set_credentials(user, self.password.clone().unwrap_or_default());
        }
        options.set_transport(build_transport(endpoint, &self.tls)?);
        Ok(options)
    }
}

enum BrokerEvent {
    Delivery(Publish),
    PublishQueued(u16),
    PublishAcked { pkid: u16, ok: bool },
    Closed(String),
}

pub struct MqttJobQueue {
    client: Client,
    events: Receiver<BrokerEvent>,
    network: Option<JoinHandle<()>>,
    backlog: VecDeque<Publish>,
    unacked: HashMap<u64, Publish>,
    next_tag: u64,
    publish_timeout: Duration,
}

impl MqttJobQueue {
    /// Connect and subscribe to the input queue.
    ///
    /// The connection completes asynchronously; failures surface on the first
    /// `next_delivery` or `publish`.
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = &settings.endpoint;
        let (client, connection) = Client::new(settings.options()?, 10);
        let filter = settings.subscription_filter();
        client
            .subscribe(filter.as_str(), QoS::AtLeastOnce)
            .with_context(|| format!("subscribe to {}", filter))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let network = std::thread::Builder::new()
            .name("mqtt-network".to_string())
            .spawn(move || drive(connection, tx))
            .context("spawn mqtt network thread")?;

        log::info!(
            "connecting to broker {}:{} (TLS: {}, auth: {}), consuming {}",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some(),
            filter
        );
        Ok(Self::with_events(
            client,
            rx,
            Some(network),
            settings.publish_timeout,
        ))
    }

    fn with_events(
        client: Client,
        events: Receiver<BrokerEvent>,
        network: Option<JoinHandle<()>>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            client,
            events,
            network,
            backlog: VecDeque::new(),
            unacked: HashMap::new(),
            next_tag: 1,
            publish_timeout,
        }
    }

    fn take_delivery(&mut self, publish: Publish) -> Delivery {
        let tag = self.next_tag;
        self.next_tag += 1;
        let delivery = Delivery {
            tag,
            topic: String::from_utf8_lossy(&publish.topic).into_owned(),
            payload: publish.payload.to_vec(),
            redelivered: publish.dup,
        };
        self.unacked.insert(tag, publish);
        delivery
    }

    /// Disconnect and wait for the network thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.network.take() {
            if let Err(e) = self.client.disconnect() {
                log::debug!("broker disconnect: {}", e);
            }
            let _ = handle.join();
        }
    }
}

impl JobQueue for MqttJobQueue {
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        if let Some(publish) = self.backlog.pop_front() {
            return Ok(Some(self.take_delivery(publish)));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(BrokerEvent::Delivery(publish)) => return Ok(Some(self.take_delivery(publish))),
                Ok(BrokerEvent::Closed(reason)) => {
                    return Err(JobError::BrokerConnectionClosed(reason).into())
                }
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(
                        JobError::BrokerConnectionClosed("network thread exited".into()).into(),
                    )
                }
            }
        }
    }

    fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<()> {
        self.client
            .publish(queue, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| JobError::BrokerPublish(e.to_string()))?;

        let deadline = Instant::now() + self.publish_timeout;
        let mut pkid = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(BrokerEvent::PublishQueued(id)) if pkid.is_none() => pkid = Some(id),
                Ok(BrokerEvent::PublishAcked { pkid: id, ok }) if Some(id) == pkid => {
                    if ok {
                        log::debug!("published to {} (pkid {})", queue, id);
                        return Ok(());
                    }
                    return Err(
                        JobError::BrokerPublish(format!("broker refused publish to {}", queue))
                            .into(),
                    );
                }
                Ok(BrokerEvent::Delivery(publish)) => self.backlog.push_back(publish),
                Ok(BrokerEvent::Closed(reason)) => {
                    return Err(JobError::BrokerConnectionClosed(reason).into())
                }
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(JobError::BrokerPublish(format!(
                        "no PUBACK for {} within {:?}",
                        queue, self.publish_timeout
                    ))
                    .into())
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(
                        JobError::BrokerConnectionClosed("network thread exited".into()).into(),
                    )
                }
            }
        }
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let publish = self
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| anyhow!("unknown delivery tag {}", delivery.tag))?;
        self.client
            .ack(&publish)
            .map_err(|e| JobError::BrokerConnectionClosed(e.to_string()))?;
        log::debug!("acked delivery {} on {}", delivery.tag, delivery.topic);
        Ok(())
    }
}

impl Drop for MqttJobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drive(mut connection: Connection, tx: Sender<BrokerEvent>) {
    for event in connection.iter() {
        let forwarded = match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                log::info!(
                    "broker connected (session present: {})",
                    ack.session_present
                );
                continue;
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => BrokerEvent::Delivery(publish),
            Ok(Event::Incoming(Incoming::PubAck(ack))) => BrokerEvent::PublishAcked {
                pkid: ack.pkid,
                ok: matches!(
                    ack.reason,
                    PubAckReason::Success | PubAckReason::NoMatchingSubscribers
                ),
            },
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => BrokerEvent::PublishQueued(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => continue,
            Err(e) => {
                log::error!("broker connection error: {}", e);
                let _ = tx.send(BrokerEvent::Closed(e.to_string()));
                break;
            }
        };
        if tx.send(forwarded).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(share_group: Option<&str>) -> MqttSettings {
        MqttSettings {
            endpoint: MqttEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1883,
                use_tls: false,
            },
            tls: TlsMaterials::default(),
            client_id: "interpreter-1".to_string(),
            username: None,
            password: None,
            input_queue: "interpreter".to_string(),
            share_group: share_group.map(str::to_string),
            keep_alive: Duration::from_secs(60),
            session_expiry: Duration::from_secs(3600),
            publish_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn plain_subscription_uses_queue_topic() {
        assert_eq!(settings(None).subscription_filter(), "interpreter");
    }

    #[test]
    fn shared_subscription_filter() {
        assert_eq!(
            settings(Some("workers")).subscription_filter(),
            "$share/workers/interpreter"
        );
    }

    #[test]
    fn options_keep_session_and_prefetch_one() {
        let options = settings(None).options().unwrap();
        let props = options.connect_properties().expect("connect properties");
        assert_eq!(props.session_expiry_interval, Some(3600));
        assert_eq!(props.receive_maximum, Some(1));
        assert!(!options.clean_start());
        assert!(options.manual_acks());
    }

    #[test]
    fn tls_material_without_tls_fails_validation() {
        let mut settings = settings(None);
        settings.tls.ca = Some(b"-----BEGIN CERTIFICATE-----".to_vec());
        assert!(settings.validate().is_err());
    }

    fn test_queue(publish_timeout: Duration) -> (MqttJobQueue, Sender<BrokerEvent>, Connection) {
        let (client, connection) =
            Client::new(MqttOptions::new("interpreter-test", "127.0.0.1", 1883), 10);
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = MqttJobQueue::with_events(client, rx, None, publish_timeout);
        (queue, tx, connection)
    }

    fn job(pkid: u16, body: &[u8]) -> Publish {
        let mut publish = Publish::new("interpreter", QoS::AtLeastOnce, body.to_vec(), None);
        publish.pkid = pkid;
        publish
    }

    fn job_error(err: &anyhow::Error) -> &JobError {
        err.downcast_ref::<JobError>().expect("job error")
    }

    #[test]
    fn publish_waits_for_matching_puback() {
        let (mut queue, tx, _connection) = test_queue(Duration::from_secs(2));
        tx.send(BrokerEvent::PublishQueued(7)).unwrap();
        tx.send(BrokerEvent::PublishAcked { pkid: 3, ok: false }).unwrap();
        tx.send(BrokerEvent::PublishAcked { pkid: 7, ok: true }).unwrap();

        queue.publish("notifier", b"{}").unwrap();
        assert!(queue.events.is_empty());
    }

    #[test]
    fn refused_puback_is_a_publish_error() {
        let (mut queue, tx, _connection) = test_queue(Duration::from_secs(2));
        tx.send(BrokerEvent::PublishQueued(4)).unwrap();
        tx.send(BrokerEvent::PublishAcked { pkid: 4, ok: false }).unwrap();

        let err = queue.publish("notifier", b"{}").unwrap_err();
        assert!(matches!(job_error(&err), JobError::BrokerPublish(_)));
    }

    #[test]
    fn missing_puback_times_out_and_leaves_job_unacked() {
        let (mut queue, tx, _connection) = test_queue(Duration::from_millis(50));
        tx.send(BrokerEvent::Delivery(job(1, b"{\"job_type\":\"person_detection\"}")))
            .unwrap();
        let delivery = queue.next_delivery(Duration::from_secs(1)).unwrap().unwrap();

        tx.send(BrokerEvent::PublishQueued(2)).unwrap();
        let err = queue.publish("notifier", b"{}").unwrap_err();
        assert!(matches!(job_error(&err), JobError::BrokerPublish(_)));
        assert!(err.to_string().contains("no PUBACK"));
        assert!(queue.unacked.contains_key(&delivery.tag));
    }

    #[test]
    fn delivery_during_publish_is_returned_next() {
        let (mut queue, tx, _connection) = test_queue(Duration::from_secs(2));
        tx.send(BrokerEvent::PublishQueued(9)).unwrap();
        tx.send(BrokerEvent::Delivery(job(5, b"second job"))).unwrap();
        tx.send(BrokerEvent::PublishAcked { pkid: 9, ok: true }).unwrap();

        queue.publish("notifier", b"{}").unwrap();
        assert_eq!(queue.backlog.len(), 1);

        let delivery = queue.next_delivery(Duration::ZERO).unwrap().unwrap();
        assert_eq!(delivery.payload, b"second job");
        assert_eq!(delivery.topic, "interpreter");
        assert!(queue.backlog.is_empty());
    }

    #[test]
    fn closed_connection_fails_publish() {
        let (mut queue, tx, _connection) = test_queue(Duration::from_secs(2));
        tx.send(BrokerEvent::Closed("connection reset".into())).unwrap();

        let err = queue.publish("notifier", b"{}").unwrap_err();
        assert!(matches!(job_error(&err), JobError::BrokerConnectionClosed(_)));
    }

    #[test]
    fn next_delivery_times_out_empty() {
        let (mut queue, _tx, _connection) = test_queue(Duration::from_secs(2));
        assert!(queue
            .next_delivery(Duration::from_millis(20))
            .unwrap()
            .is_none());
    }

    #[test]
    fn ack_consumes_the_delivery_tag() {
        let (mut queue, tx, _connection) = test_queue(Duration::from_secs(2));
        tx.send(BrokerEvent::Delivery(job(3, b"{}"))).unwrap();
        let delivery = queue.next_delivery(Duration::from_secs(1)).unwrap().unwrap();

        queue.ack(&delivery).unwrap();
        assert!(queue.unacked.is_empty());
        assert!(queue.ack(&delivery).is_err());
    }
}
