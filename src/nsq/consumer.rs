use super::frame::{self, Delivery, Frame, MessageId};
use super::lookup::Lookupd;
use crate::config::NsqConfig;
use anyhow::bail;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};

#[derive(Debug)]
pub enum NsqEvent {
    Message(Delivery),
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub enum NsqCommand {
    Finish(MessageId),
    Requeue(MessageId, Duration),
    /// Still working on it, restart nsqd's timeout
    Touch(MessageId),
}

/// Drives `work` to completion, asking the consumer to TOUCH `id` every
/// `every` meanwhile so nsqd does not time the message out and hand it to
/// someone else.
pub async fn keep_alive<F: Future>(
    id: MessageId,
    commands: &mpsc::Sender<NsqCommand>,
    every: Duration,
    work: F,
) -> F::Output {
    tokio::pin!(work);
    let mut ticks = interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticks.tick() => {
                log::debug!("Message {} still in progress, touching", id);
                if commands.send(NsqCommand::Touch(id)).await.is_err() {
                    return work.await;
                }
            }
        }
    }
}

type FrameResult = anyhow::Result<Frame>;

/// Subscribes to the inbound topic and forwards deliveries as [`NsqEvent`]s.
/// FIN/REQ/TOUCH come back through [`NsqCommand`]s.
pub struct NsqConsumer {
    config: NsqConfig,
    tx: mpsc::Sender<NsqEvent>,
    rx_cmd: mpsc::Receiver<NsqCommand>,
    subscribed: bool,
}

impl NsqConsumer {
    pub fn new(config: NsqConfig, tx: mpsc::Sender<NsqEvent>, rx_cmd: mpsc::Receiver<NsqCommand>) -> Self {
        Self {
            config,
            tx,
            rx_cmd,
            subscribed: false,
        }
    }

    // 断线后指数退避重连，直到事件接收端关闭
    pub async fn run(mut self) {
        let mut retry_delay = 1;
        loop {
            self.subscribed = false;
            match self.connect_and_loop().await {
                Ok(()) => break,
                Err(e) => {
                    // 成功订阅过说明 nsqd 可用，从最小间隔重新开始
                    if self.subscribed {
                        retry_delay = 1;
                    }
                    log::error!("nsqd connection error: {}. Retrying in {}s...", e, retry_delay);
                    if self.tx.send(NsqEvent::Disconnected).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(retry_delay)).await;
                    retry_delay = std::cmp::min(retry_delay * 2, self.config.reconnect_max_secs.max(1));
                }
            }
        }
        log::info!("NSQ consumer stopped");
    }

    async fn nsqd_address(&self) -> anyhow::Result<String> {
        let Some(url) = self.config.lookup_url() else {
            return Ok(self.config.nsqd_address.clone());
        };
        let address = Lookupd::new(url)?
            .producer_for(&self.config.inbound_topic)
            .await?;
        log::info!("nsqlookupd: topic {} is on {}", self.config.inbound_topic, address);
        Ok(address)
    }

    /// Ok means shutdown: one of our channels closed.
    async fn connect_and_loop(&mut self) -> anyhow::Result<()> {
        let address = self.nsqd_address().await?;
        log::info!("Connecting to nsqd {}...", address);
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        writer.write_all(frame::MAGIC_V2).await?;
        writer
            .write_all(&frame::sub(&self.config.inbound_topic, &self.config.channel))
            .await?;
        match frame::read_frame(&mut reader).await? {
            Frame::Response(data) if data == frame::OK => {}
            Frame::Error(data) => bail!("SUB rejected: {}", String::from_utf8_lossy(&data)),
            other => bail!("unexpected reply to SUB: {:?}", other),
        }
        writer.write_all(&frame::rdy(self.config.max_in_flight)).await?;
        self.subscribed = true;
        log::info!(
            "Subscribed to {}/{} on {}",
            self.config.inbound_topic,
            self.config.channel,
            address
        );

        if self.tx.send(NsqEvent::Connected).await.is_err() {
            return Ok(());
        }

        // read_frame 不能在 select! 里被取消，单独放到读任务中
        let (frame_tx, mut frames) = mpsc::channel::<FrameResult>(16);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = frame::read_frame(&mut reader).await;
                let failed = result.is_err();
                if frame_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self.pump(&mut writer, &mut frames).await;
        reader_task.abort();
        result
    }

    async fn pump(
        &mut self,
        writer: &mut OwnedWriteHalf,
        frames: &mut mpsc::Receiver<FrameResult>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                next = frames.recv() => {
                    match next {
                        Some(Ok(Frame::Response(data))) if data == frame::HEARTBEAT => {
                            writer.write_all(&frame::nop()).await?;
                        }
                        Some(Ok(Frame::Response(data))) => {
                            log::debug!("nsqd response: {}", String::from_utf8_lossy(&data));
                        }
                        Some(Ok(Frame::Error(data))) => {
                            // E_FIN_FAILED 之类的错误不会断开连接
                            log::warn!("nsqd error: {}", String::from_utf8_lossy(&data));
                        }
                        Some(Ok(Frame::Message(delivery))) => {
                            log::debug!(
                                "Received message {} (attempt {}, queued at {}ns)",
                                delivery.id,
                                delivery.attempts,
                                delivery.timestamp
                            );
                            if self.tx.send(NsqEvent::Message(delivery)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => bail!("connection closed"),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NsqCommand::Finish(id)) => writer.write_all(&frame::fin(&id)).await?,
                        Some(NsqCommand::Requeue(id, delay)) => {
                            writer.write_all(&frame::req(&id, delay)).await?
                        }
                        Some(NsqCommand::Touch(id)) => writer.write_all(&frame::touch(&id)).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
