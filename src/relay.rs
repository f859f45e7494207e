use crate::envelope::{self, ChatEnvelope};
use crate::error::RelayError;
use crate::nsq::Delivery;
use crate::pipeline::TranslationPipeline;
use async_trait::async_trait;
use std::sync::Arc;

/// Outbound side of the channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), RelayError>;
}

/// What to tell the channel about a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Translated and republished.
    Finish,
    /// Worth another attempt later.
    Requeue,
    /// Failed for good; acknowledged so it is not delivered again.
    Discard,
}

pub struct RelayWorker {
    pipeline: Arc<TranslationPipeline>,
    publisher: Arc<dyn Publisher>,
    outbound_topic: String,
    max_attempts: u16,
}

impl RelayWorker {
    pub fn new(
        pipeline: Arc<TranslationPipeline>,
        publisher: Arc<dyn Publisher>,
        outbound_topic: impl Into<String>,
        max_attempts: u16,
    ) -> Self {
        Self {
            pipeline,
            publisher,
            outbound_topic: outbound_topic.into(),
            max_attempts,
        }
    }

    /// Runs one message start to finish and decides its fate. Nothing is
    /// published unless every step succeeded.
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let mut describe = format!("{} bytes, undecoded", delivery.body.len());
        match self.process(&delivery.body, &mut describe).await {
            Ok(()) => {
                log::info!("Relayed message {} ({})", delivery.id, describe);
                Disposition::Finish
            }
            Err(e) if e.is_rejection() => {
                log::error!("Rejected message {} ({}): {}", delivery.id, describe, e);
                Disposition::Discard
            }
            Err(e) if delivery.attempts >= self.max_attempts => {
                log::error!(
                    "Dropping message {} after {} attempts ({}): {}",
                    delivery.id,
                    delivery.attempts,
                    describe,
                    e
                );
                Disposition::Discard
            }
            Err(e) => {
                log::error!(
                    "Message {} failed on attempt {} ({}): {}",
                    delivery.id,
                    delivery.attempts,
                    describe,
                    e
                );
                Disposition::Requeue
            }
        }
    }

    async fn process(&self, body: &[u8], describe: &mut String) -> Result<(), RelayError> {
        let (packet, mut envelope): (_, ChatEnvelope) = envelope::decode(body)?;
        *describe = format!("topic={} {}", packet.topic, envelope.describe());

        let result = self.pipeline.run(&mut envelope).await?;

        // 发布成功前结果文件仍由 guard 持有，失败时随 guard 一起删除
        let frame = envelope::encode(&packet, &envelope)?;
        self.publisher.publish(&self.outbound_topic, &frame).await?;
        result.persist();
        Ok(())
    }
}
