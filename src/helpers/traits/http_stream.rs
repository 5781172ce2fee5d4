use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::helpers::traits::http_response::{send_bytes, ACKNOWLEDGEMENT};
use crate::{Options, RawRequest, ReadEnd};

#[async_trait]
pub trait StreamCapture {
    /// Drains the connection until the peer closes, the size cap is passed or
    /// the idle timeout elapses. Never fails: whatever arrived is the request.
    async fn read_request(&mut self, options: &Options) -> RawRequest;

    /// Sends the fixed acknowledgement and shuts down the write half.
    async fn acknowledge(&mut self) -> io::Result<()>;
}

#[async_trait]
impl StreamCapture for TcpStream {
    async fn read_request(&mut self, options: &Options) -> RawRequest {
        if let Err(e) = self.set_nodelay(options.no_delay) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        get_bytes_from_reader(self, options).await
    }

    async fn acknowledge(&mut self) -> io::Result<()> {
        send_bytes(self, ACKNOWLEDGEMENT).await
    }
}

pub async fn get_bytes_from_reader<R>(reader: &mut R, options: &Options) -> RawRequest
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let idle_timeout = options.idle_timeout();
    let mut bytes: Vec<u8> = Vec::new();
    let mut buf = vec![0; options.read_buffer_size.max(1)];

    let end = loop {
        match timeout(idle_timeout, reader.read(&mut buf)).await {
            Err(_) => break ReadEnd::IdleTimeout,
            Ok(Ok(0)) => break ReadEnd::PeerClosed,
            Ok(Ok(n)) => {
                bytes.extend_from_slice(&buf[..n]);
                if bytes.len() > options.max_bytes {
                    break ReadEnd::SizeCap;
                }
            }
            Ok(Err(ref e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => {
                warn!(error = %e, received = bytes.len(), "read failed, keeping partial request");
                break ReadEnd::Failed(e.kind());
            }
        }
    };

    debug!(len = bytes.len(), end = ?end, "request read finished");
    RawRequest::new(bytes, end)
}
