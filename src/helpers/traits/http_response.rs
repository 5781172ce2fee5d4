use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Reply sent to every client regardless of what was captured.
pub const ACKNOWLEDGEMENT: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nReceived";

pub async fn send_bytes<W>(stream: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    stream.shutdown().await
}
