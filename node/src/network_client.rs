use async_trait::async_trait;
use chordal_lib::{ChordError, DhtMessage, Result};
use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Transport used by a node to reach its peers. Any failure to get a
/// well-formed reply is reported as `PeerUnreachable` or
/// `ProtocolViolation`; both count as a dead peer for repair purposes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync + 'static {
    async fn call_node(&self, address: &str, message: DhtMessage) -> Result<DhtMessage>;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
// Upper bound on one encoded message; partition replies are the largest.
pub(crate) const MAX_MESSAGE_BYTES: u64 = 64 * 1024 * 1024;

/// One TCP connection per request: the encoded request is written, the
/// write half is shut down to mark the end of the frame, and the reply is
/// read until the peer closes.
pub struct RealNetworkClient {
    timeout: Duration,
    retries: u32,
}

impl Default for RealNetworkClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, 1)
    }
}

impl RealNetworkClient {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }

    async fn call_node_with_retry(&self, address: &str, message: DhtMessage) -> Result<DhtMessage> {
        let mut delay = INITIAL_RETRY_DELAY;
        let attempts = self.retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                debug!(
                    "Retrying connection to {} (attempt {}/{})",
                    address,
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(delay).await;
                delay *= 2; // Exponential backoff
            }

            match self.call_node_internal(address, message.clone()).await {
                Ok(response) => return Ok(response),
                // A malformed reply will not improve by asking again
                Err(e @ ChordError::ProtocolViolation(_)) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ChordError::PeerUnreachable(format!("{}: no attempt made", address))))
    }

    async fn call_node_internal(&self, address: &str, message: DhtMessage) -> Result<DhtMessage> {
        let unreachable = |what: String| ChordError::PeerUnreachable(format!("{}: {}", address, what));

        let mut stream = match timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unreachable(format!("connect failed: {}", e))),
            Err(_) => return Err(unreachable(format!("connect timed out after {:?}", self.timeout))),
        };

        let encoded = encode(&message)?;
        debug!("Sending message to {}: {:?}", address, message);

        match timeout(self.timeout, stream.write_all(&encoded)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(unreachable(format!("write failed: {}", e))),
            Err(_) => return Err(unreachable("write timed out".to_string())),
        }

        match timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown error (non-critical): {}", e),
            Err(_) => debug!("Shutdown timed out (non-critical)"),
        }

        let response = match timeout(self.timeout, read_message(&mut stream)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(unreachable("read timed out".to_string())),
        };
        debug!("Received response from {}: {:?}", address, response);

        Ok(response)
    }
}

#[async_trait]
impl NetworkClient for RealNetworkClient {
    async fn call_node(&self, address: &str, message: DhtMessage) -> Result<DhtMessage> {
        self.call_node_with_retry(address, message).await
    }
}

pub(crate) fn encode(message: &DhtMessage) -> Result<Vec<u8>> {
    bincode::serialize(message)
        .map_err(|e| ChordError::InvalidArgument(format!("failed to encode message: {}", e)))
}

/// Reads one whole frame (until EOF) and decodes it.
pub(crate) async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<DhtMessage> {
    let mut buffer = Vec::new();
    let mut limited = AsyncReadExt::take(reader, MAX_MESSAGE_BYTES + 1);
    limited
        .read_to_end(&mut buffer)
        .await
        .map_err(|e| ChordError::PeerUnreachable(format!("read failed: {}", e)))?;

    if buffer.len() as u64 > MAX_MESSAGE_BYTES {
        warn!("Dropping message larger than {} bytes", MAX_MESSAGE_BYTES);
        return Err(ChordError::ProtocolViolation(
            "message exceeds size limit".to_string(),
        ));
    }

    bincode::deserialize(&buffer)
        .map_err(|e| ChordError::ProtocolViolation(format!("undecodable message: {}", e)))
}
