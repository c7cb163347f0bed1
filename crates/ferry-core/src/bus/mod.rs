//! Dual consumer/producer bus client.
//!
//! [`DualClient`] multiplexes one logical bus identity into a
//! consumer-group subscription on one topic and a synchronous producer on
//! another. The consumer side feeds a bounded delivery channel; a full
//! channel blocks the consumer loop, which is the backpressure mechanism.
//! The producer side awaits broker acknowledgement before returning, so a
//! caller that has seen `produce` succeed knows the bus holds the message.
//!
//! Offsets are stored explicitly via [`DualClient::store_offset`] after the
//! caller has finished with a message; the client commits stored offsets in
//! the background. A crash before the store redelivers the message.

use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::util::Timeout;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::protocol::envelope;

/// Capacity of the delivery channel between the consumer loop and the
/// application. When full, the consumer loop blocks.
pub const DELIVERY_QUEUE_DEPTH: usize = 1024;

/// Errors from constructing or using the bus client.
#[derive(Debug, Error)]
pub enum BusError {
    /// Client construction or subscription failed.
    #[error("setting up bus client")]
    Setup(#[source] KafkaError),

    /// The broker did not acknowledge a produced message.
    #[error("publishing message to bus")]
    Produce(#[source] KafkaError),

    /// Storing a consumed offset failed.
    #[error("storing consumer offset")]
    OffsetStore(#[source] KafkaError),
}

/// A message taken off the consumer topic, with enough position
/// information to store its offset once handled.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    /// Topic the message was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Raw frame bytes (a sealed envelope).
    pub payload: Vec<u8>,
}

/// Consumer context that surfaces rebalances and commit outcomes as log
/// events without interrupting the consumer loop.
pub struct LoggingConsumerContext;

impl ClientContext for LoggingConsumerContext {}

impl ConsumerContext for LoggingConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        warn!(?rebalance, "bus consumer rebalancing");
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        warn!(?rebalance, "bus consumer rebalance complete");
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(err) = result {
            error!(error = %err, "bus offset commit failed");
        }
    }
}

fn apply_transport(client_cfg: &mut ClientConfig, cfg: &BusConfig) {
    client_cfg.set("security.protocol", cfg.security_protocol());
    if cfg.sasl.enabled {
        client_cfg.set("sasl.mechanisms", "PLAIN");
        client_cfg.set("sasl.username", &cfg.sasl.username);
        if let Some(password) = &cfg.sasl.password {
            client_cfg.set("sasl.password", password.expose_secret());
        }
        if !cfg.sasl.handshake {
            warn!("sasl handshake cannot be disabled with this client; proceeding with handshake");
        }
    }
    if cfg.tls.enabled && cfg.tls.insecure_skip_verify {
        client_cfg.set("enable.ssl.certificate.verification", "false");
    }
}

/// One consumer-group subscription plus one synchronous producer.
pub struct DualClient {
    consumer: StreamConsumer<LoggingConsumerContext>,
    producer: FutureProducer,
    producer_topic: String,
    signature_key: SecretString,
}

impl DualClient {
    /// Builds the consumer and producer connections and subscribes to
    /// `consumer_topic`.
    ///
    /// The consumer joins `cfg.group_id` and starts from the oldest
    /// uncommitted offset on first join, so a freshly provisioned consumer
    /// replays the backlog addressed to it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Setup`] when either connection cannot be
    /// created or the subscription fails.
    pub fn new(
        cfg: &BusConfig,
        consumer_topic: &str,
        producer_topic: &str,
    ) -> Result<Self, BusError> {
        let mut consumer_cfg = ClientConfig::new();
        consumer_cfg
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("group.id", &cfg.group_id)
            .set("client.id", format!("{}-consumer", cfg.client_id))
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            // Offsets advance only when the application stores them.
            .set("enable.auto.offset.store", "false");
        apply_transport(&mut consumer_cfg, cfg);

        let consumer: StreamConsumer<LoggingConsumerContext> = consumer_cfg
            .create_with_context(LoggingConsumerContext)
            .map_err(BusError::Setup)?;
        consumer
            .subscribe(&[consumer_topic])
            .map_err(BusError::Setup)?;

        let mut producer_cfg = ClientConfig::new();
        producer_cfg
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("client.id", format!("{}-producer", cfg.client_id));
        apply_transport(&mut producer_cfg, cfg);

        let producer: FutureProducer = producer_cfg.create().map_err(BusError::Setup)?;

        Ok(Self {
            consumer,
            producer,
            producer_topic: producer_topic.to_owned(),
            signature_key: cfg.signature_key.clone(),
        })
    }

    /// Creates the bounded delivery channel sized for this client.
    #[must_use]
    pub fn delivery_channel() -> (
        mpsc::Sender<ConsumedMessage>,
        mpsc::Receiver<ConsumedMessage>,
    ) {
        mpsc::channel(DELIVERY_QUEUE_DEPTH)
    }

    /// The shared signature key for sealing and opening envelopes.
    #[must_use]
    pub fn signature_key(&self) -> &[u8] {
        self.signature_key.expose_secret().as_bytes()
    }

    /// Runs the consumer loop until the delivery channel is closed.
    ///
    /// Consumer errors are logged and do not interrupt the loop. The loop
    /// exits when every receiver of `tx` has been dropped, which is the
    /// shutdown signal for the consumer side.
    pub async fn consumer_loop(&self, tx: mpsc::Sender<ConsumedMessage>) {
        info!("starting bus consumer loop");

        loop {
            match self.consumer.recv().await {
                Ok(msg) => {
                    let consumed = ConsumedMessage {
                        topic: msg.topic().to_owned(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        payload: msg.payload().unwrap_or_default().to_vec(),
                    };
                    if tx.send(consumed).await.is_err() {
                        info!("delivery channel closed; shutting down bus consumer loop");
                        return;
                    }
                }
                Err(err) => {
                    error!(error = %err, "bus consumer error");
                }
            }
        }
    }

    /// Publishes a raw frame to the producer topic, awaiting broker
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Produce`] when the broker rejects the message
    /// or the delivery report signals an error.
    pub async fn produce(&self, frame: Vec<u8>) -> Result<(), BusError> {
        self.send_record(frame, None).await
    }

    /// Like [`DualClient::produce`], but stamps the bus message with the
    /// given time (seconds since epoch) instead of the send time.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Produce`] when the broker rejects the message
    /// or the delivery report signals an error.
    pub async fn produce_at(&self, frame: Vec<u8>, timestamp: i64) -> Result<(), BusError> {
        self.send_record(frame, Some(timestamp)).await
    }

    async fn send_record(&self, frame: Vec<u8>, timestamp: Option<i64>) -> Result<(), BusError> {
        let mut record = FutureRecord::<(), _>::to(&self.producer_topic).payload(&frame);
        if let Some(secs) = timestamp {
            record = record.timestamp(secs.saturating_mul(1000));
        }
        self.producer
            .send(record, Timeout::Never)
            .await
            .map_err(|(err, _)| BusError::Produce(err))?;
        debug!(topic = %self.producer_topic, bytes = frame.len(), "message produced");
        Ok(())
    }

    /// Seals a protocol message with the shared signature key and
    /// publishes it, awaiting broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Produce`] when publishing fails.
    pub async fn produce_sealed<M: prost::Message>(&self, msg: &M) -> Result<(), BusError> {
        let frame = envelope::seal(msg, self.signature_key());
        self.produce(frame).await
    }

    /// Stores the consume position past a handled message for background
    /// commit.
    ///
    /// Called after the status for the message has been enqueued for
    /// publication; a crash before this point redelivers the message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::OffsetStore`] when the underlying store fails.
    pub fn store_offset(&self, msg: &ConsumedMessage) -> Result<(), BusError> {
        // The stored offset is the next position to consume.
        self.consumer
            .store_offset(&msg.topic, msg.partition, msg.offset + 1)
            .map_err(BusError::OffsetStore)
    }
}
