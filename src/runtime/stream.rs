use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;

/// Object-safe alias for anything the client engines can speak over:
/// a TCP stream or its TLS wrapping, boxed so STARTTLS/STLS upgrades can
/// swap the transport without changing the caller's type.
pub trait AsyncStream: tokio::io::AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Unified stream over plain and TLS transports.
///
/// Generic over the inner transport so sessions run identically on real
/// sockets and on in-memory duplex pipes in tests. The `Upgrading` state
/// exists only inside a STARTTLS/STLS swap and must never see I/O.
pub enum MailStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    Upgrading,
}

impl<S> MailStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, MailStream::Tls(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MailStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MailStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            MailStream::Upgrading => panic!("I/O attempted during TLS upgrade"),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MailStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MailStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            MailStream::Upgrading => panic!("I/O attempted during TLS upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MailStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            MailStream::Upgrading => panic!("I/O attempted during TLS upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MailStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            MailStream::Upgrading => panic!("I/O attempted during TLS upgrade"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_plain_passthrough() {
        let (client, server) = tokio::io::duplex(64);
        let mut near = MailStream::Plain(client);
        let mut far = server;

        near.write_all(b"ping").await.unwrap();
        near.flush().await.unwrap();

        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(!near.is_tls());
    }
}
