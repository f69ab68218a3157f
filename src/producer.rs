use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::ProducerError;

/// One message bound for the log sink. Keyed messages partition by key;
/// unkeyed ones round-robin.
#[derive(Clone, Debug)]
pub struct LogMessage {
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl LogMessage {
    pub fn new(key: Option<String>, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }
}

/// The log-producer seam. The production implementation batches and acks
/// asynchronously; tests substitute a recording fake.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn queue(&self, topic: &str, messages: Vec<LogMessage>) -> Result<(), ProducerError>;
}

pub async fn create_kafka_producer(config: &Config) -> Result<FutureProducer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer = client_config.create()?;

    // "Ping" the brokers by requesting metadata, so a misconfigured producer
    // fails at startup rather than on the first event.
    match producer
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(2))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(err) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", err);
            return Err(err);
        }
    }

    Ok(producer)
}

pub struct KafkaMessageProducer {
    producer: FutureProducer,
}

impl KafkaMessageProducer {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl MessageProducer for KafkaMessageProducer {
    async fn queue(&self, topic: &str, messages: Vec<LogMessage>) -> Result<(), ProducerError> {
        let mut delivery_futures = Vec::with_capacity(messages.len());

        for message in &messages {
            match self.producer.send_result(FutureRecord {
                topic,
                payload: Some(&message.payload),
                partition: None,
                key: message.key.as_deref(),
                timestamp: None,
                headers: None,
            }) {
                Ok(future) => delivery_futures.push(future),
                Err((err, _)) => return Err(ProducerError::Produce(err.to_string())),
            }
        }

        for result in join_all(delivery_futures).await {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err((err, _))) => return Err(ProducerError::Produce(err.to_string())),
                // Cancelled due to timeout while retrying
                Err(_) => return Err(ProducerError::Canceled),
            }
        }

        Ok(())
    }
}
