//! ConnectedPort: one virtual connection tunneled through an RPC client,
//! plus the byte-stream adapter that lets the optional end-to-end TLS
//! layer and the front-end copy loops treat it as an ordinary socket.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::debug;

use diode_core::util::Address;

use crate::channel;
use crate::client::Client;
use crate::error::{Error, Result};

/// Payload cap per `portsend` frame; larger writes are fragmented.
pub const PACKET_LIMIT: usize = 65_000;

pub struct ConnectedPort {
    pub(crate) ref_id: Vec<u8>,
    pub(crate) device: Address,
    pub(crate) client: Client,
    pub(crate) in_rx: mpsc::Receiver<Vec<u8>>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConnectedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedPort")
            .field("ref_id", &self.ref_id)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl ConnectedPort {
    pub fn ref_id(&self) -> &[u8] {
        &self.ref_id
    }

    pub fn device(&self) -> Address {
        self.device
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Send bytes to the device, fragmenting at the packet limit.
    /// Delivery is ordered within the TLS stream.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport(io::ErrorKind::BrokenPipe.into()));
        }
        for chunk in data.chunks(PACKET_LIMIT) {
            self.client.cast_port_send(&self.ref_id, chunk.to_vec()).await?;
        }
        Ok(())
    }

    /// Next inbound payload; `None` once the port is closed and drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.in_rx.recv().await
    }

    /// Close both sides; idempotent. The server is told best-effort.
    pub async fn close(&self) {
        self.client.close_port(&self.ref_id).await;
    }

    /// Turn the port into an async byte stream. A background task drains
    /// local writes into `portsend` casts and closes the port when the
    /// write side shuts down.
    pub fn into_stream(self) -> PortStream {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);
        let client = self.client.clone();
        let ref_id = self.ref_id.clone();
        tokio::spawn(async move {
            while let Some(chunk) = out_rx.recv().await {
                if let Err(err) = client.cast_port_send(&ref_id, chunk).await {
                    debug!(%err, "port write failed");
                    break;
                }
            }
            client.close_port(&ref_id).await;
        });
        PortStream {
            in_rx: self.in_rx,
            pending: None,
            out: PollSender::new(out_tx),
        }
    }
}

/// `AsyncRead`/`AsyncWrite` over a ConnectedPort. Reads pop the port's
/// bounded inbound queue; writes hand fragments to the outbound pump.
pub struct PortStream {
    in_rx: mpsc::Receiver<Vec<u8>>,
    pending: Option<(Vec<u8>, usize)>,
    out: PollSender<Vec<u8>>,
}

impl AsyncRead for PortStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some((chunk, offset)) = &mut self.pending {
                let n = buf.remaining().min(chunk.len() - *offset);
                buf.put_slice(&chunk[*offset..*offset + n]);
                *offset += n;
                if *offset == chunk.len() {
                    self.pending = None;
                }
                return Poll::Ready(Ok(()));
            }
            match self.in_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.pending = Some((chunk, 0));
                }
                // queue dropped: the port was closed, surface EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for PortStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(PACKET_LIMIT);
                self.out
                    .send_item(buf[..n].to_vec())
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.out.close();
        Poll::Ready(Ok(()))
    }
}

/// Layer the optional end-to-end TLS handshake over an open tunnel,
/// initiator side. The edge server only ever sees ciphertext afterwards.
pub async fn e2e_connect<S>(stream: S) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = channel::insecure_client_config()?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let name = rustls::pki_types::ServerName::try_from("device.diode".to_string())
        .expect("static server name");
    Ok(connector.connect(name, stream).await?)
}

/// Accepting side of the end-to-end handshake (the published device).
pub async fn e2e_accept<S>(stream: S) -> Result<tokio_rustls::server::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = channel::insecure_server_config()?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
    Ok(acceptor.accept(stream).await?)
}

/// Pump bytes both ways until either side closes.
pub async fn relay<A, B>(mut a: A, mut b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(err) = tokio::io::copy_bidirectional(&mut a, &mut b).await {
        debug!(%err, "relay finished with error");
    }
}
