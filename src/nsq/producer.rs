use super::frame::{self, Frame};
use crate::error::RelayError;
use crate::relay::Publisher;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Publishes over a single lazily opened nsqd connection.
pub struct NsqProducer {
    address: String,
    conn: Mutex<Option<TcpStream>>,
}

impl NsqProducer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream, RelayError> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        stream.write_all(frame::MAGIC_V2).await?;
        log::info!("Connected to nsqd {} for publishing", self.address);
        Ok(stream)
    }

    async fn send(stream: &mut TcpStream, topic: &str, body: &[u8]) -> Result<(), RelayError> {
        stream.write_all(&frame::publish(topic, body)).await?;
        loop {
            let reply = frame::read_frame(stream)
                .await
                .map_err(|e| RelayError::Transport(e.to_string()))?;
            match reply {
                Frame::Response(data) if data == frame::HEARTBEAT => {
                    stream.write_all(&frame::nop()).await?;
                }
                Frame::Response(data) if data == frame::OK => return Ok(()),
                Frame::Response(data) => {
                    return Err(RelayError::Transport(format!(
                        "unexpected reply to PUB: {}",
                        String::from_utf8_lossy(&data)
                    )));
                }
                Frame::Error(data) => {
                    return Err(RelayError::Upstream {
                        service: "nsqd",
                        code: -1,
                        message: String::from_utf8_lossy(&data).into_owned(),
                    });
                }
                Frame::Message(_) => {
                    return Err(RelayError::Transport("message frame on a publish connection".into()));
                }
            }
        }
    }
}

#[async_trait]
impl Publisher for NsqProducer {
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), RelayError> {
        let mut slot = self.conn.lock().await;

        // 连接只在成功后放回，出错或被取消时直接丢弃
        if let Some(mut stream) = slot.take() {
            match Self::send(&mut stream, topic, body).await {
                Ok(()) => {
                    *slot = Some(stream);
                    return Ok(());
                }
                Err(RelayError::Transport(e)) => {
                    log::warn!("Publish connection to {} broken ({}), reconnecting", self.address, e);
                }
                Err(e) => return Err(e),
            }
        }

        let mut stream = self.connect().await?;
        Self::send(&mut stream, topic, body).await?;
        *slot = Some(stream);
        Ok(())
    }
}
