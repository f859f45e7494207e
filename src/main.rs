mod codec;
mod config;
mod credential;
mod envelope;
mod error;
mod http_api;
mod nsq;
mod pipeline;
mod protocol;
mod relay;
mod speech;
mod staging;
#[cfg(test)]
mod test_support;
mod translator;

use codec::{AudioCodec, ExternalCodec};
use config::Config;
use credential::{CredentialRefresher, CredentialStore, OAuthTokenSource};
use nsq::{NsqCommand, NsqConsumer, NsqEvent, NsqProducer};
use pipeline::TranslationPipeline;
use relay::{Disposition, RelayWorker};
use speech::{BaiduRecognizer, BaiduSynthesizer};
use staging::StagingArea;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use translator::BaiduTranslator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，默认 info 级别，可用 RUST_LOG 覆盖
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 加载配置
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "relay.toml".to_string());
    let config = Config::load(&config_path)?;
    log::info!("Loaded configuration from {}", config_path);

    // 先恢复上次保存的 token，再启动后台刷新
    let credentials = Arc::new(CredentialStore::new(&config.credential.persist_path));
    credentials.restore(config.credential.refresh_interval()).await;
    let refresher = CredentialRefresher::from_config(
        credentials.clone(),
        Box::new(OAuthTokenSource::new(&config.credential)?),
        &config.credential,
    );
    tokio::spawn(refresher.run());

    // 组装翻译流水线
    let codec: Arc<dyn AudioCodec> = Arc::new(ExternalCodec::new(&config.codec));
    let pipeline = Arc::new(TranslationPipeline::new(
        Arc::new(BaiduTranslator::new(&config.translate)?),
        Arc::new(BaiduRecognizer::new(&config.speech, credentials.clone())?),
        Arc::new(BaiduSynthesizer::new(&config.speech, credentials.clone(), codec.clone())?),
        codec,
        StagingArea::new(&config.staging),
    ));

    if config.http.enabled {
        let listen = config.http.listen.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = http_api::serve(&listen, pipeline).await {
                log::error!("HTTP endpoint error: {}", e);
            }
        });
    }

    // 拿到 token 之前不消费消息
    log::info!("Waiting for an access token...");
    tokio::select! {
        _ = credentials.wait_ready() => {}
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
            return Ok(());
        }
    }

    if let Some(token) = credentials.current() {
        log::info!(
            "Access token ready, fetched {:?} ago, refreshed every {:?}",
            token.fetched_at.elapsed().unwrap_or_default(),
            token.validity
        );
    }

    let producer = Arc::new(NsqProducer::new(config.nsq.nsqd_address.clone()));
    let worker = Arc::new(RelayWorker::new(
        pipeline,
        producer,
        config.nsq.outbound_topic.clone(),
        config.nsq.max_attempts,
    ));

    // 事件通道
    let (tx_nsq_event, mut rx_nsq_event) = mpsc::channel::<NsqEvent>(100);
    // 命令通道
    let (tx_nsq_cmd, rx_nsq_cmd) = mpsc::channel::<NsqCommand>(100);

    let consumer = NsqConsumer::new(config.nsq.clone(), tx_nsq_event, rx_nsq_cmd);
    tokio::spawn(consumer.run());

    let requeue_delay = Duration::from_millis(config.nsq.requeue_delay_ms);
    let touch_interval = config.nsq.touch_interval();
    log::info!(
        "Relaying {} -> {} via {}",
        config.nsq.inbound_topic,
        config.nsq.outbound_topic,
        config.nsq.lookupd_http_address.as_deref().unwrap_or(&config.nsq.nsqd_address)
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(event) = rx_nsq_event.recv() => {
                match event {
                    NsqEvent::Message(delivery) => {
                        // 每条消息独立处理，并发度由 max_in_flight 控制
                        // 处理期间定时 TOUCH，避免 nsqd 超时重投
                        let worker = worker.clone();
                        let tx_cmd = tx_nsq_cmd.clone();
                        tokio::spawn(async move {
                            let disposition =
                                nsq::keep_alive(delivery.id, &tx_cmd, touch_interval, worker.handle(&delivery)).await;
                            let cmd = match disposition {
                                Disposition::Finish | Disposition::Discard => NsqCommand::Finish(delivery.id),
                                Disposition::Requeue => NsqCommand::Requeue(delivery.id, requeue_delay),
                            };
                            if let Err(e) = tx_cmd.send(cmd).await {
                                log::error!("Failed to acknowledge message {}: {}", delivery.id, e);
                            }
                        });
                    }
                    NsqEvent::Connected => log::info!("NSQ consumer connected"),
                    NsqEvent::Disconnected => log::warn!("NSQ consumer disconnected"),
                }
            }
        }
    }
    Ok(())
}
