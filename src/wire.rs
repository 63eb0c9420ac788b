// =============================================================================
// LAGRANGE RELAY — wire.rs
// =============================================================================
//
// Wire format: [4 bytes длина big-endian][UTF-8 JSON envelope]
//
// Framing between stages, same shape as a peer packet. The pumps bridge a
// socket half and an mpsc channel so the stages themselves only see strings.
// =============================================================================

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{Disposition, RelayError, Result};

pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

pub struct FrameReader<R> {
    inner: R,
    codec: LengthDelimitedCodec,
    buf: BytesMut,
    /// Bytes of an unfinished frame were read (the codec may have consumed its header).
    partial: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader { inner, codec: codec(), buf: BytesMut::with_capacity(64 * 1024), partial: false }
    }

    /// `Ok(None)` on a clean close between frames.
    pub async fn next_text(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                self.partial = !self.buf.is_empty();
                return String::from_utf8(frame.to_vec())
                    .map(Some)
                    .map_err(|e| RelayError::malformed(format!("frame is not UTF-8: {}", e)));
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if !self.partial {
                    return Ok(None);
                }
                return Err(RelayError::UnexpectedDisconnect(format!(
                    "stream closed inside a frame ({} bytes buffered)",
                    self.buf.len()
                )));
            }
            self.partial = true;
        }
    }
}

pub struct FrameWriter<W> {
    inner: W,
    codec: LengthDelimitedCodec,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter { inner, codec: codec(), buf: BytesMut::new() }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.buf.clear();
        self.codec.encode(Bytes::copy_from_slice(text.as_bytes()), &mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Socket → channel. Returns when the peer closes; dropping `tx` closes the channel.
pub async fn pump_in<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = reader.next_text() => next,
        };
        match next {
            Ok(Some(text)) => {
                if tx.send(text).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) if e.disposition() == Disposition::Skip => log::warn!("⏭️  frame skipped: {}", e),
            Err(e) => return Err(e),
        }
    }
}

/// Channel → socket. A failed write means the peer is gone.
pub async fn pump_out<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            text = rx.recv() => match text {
                Some(text) => text,
                None => return Ok(()),
            },
        };
        if let Err(e) = writer.send_text(&text).await {
            cancel.cancel();
            return Err(RelayError::UnexpectedDisconnect(format!("write failed: {}", e)));
        }
    }
}

/// Watches the read half of a peer that never talks back and fires `cancel`
/// once it closes. Stray inbound bytes are discarded.
pub async fn cancel_on_close<R: AsyncRead + Unpin>(mut inner: R, cancel: CancellationToken) {
    let mut scratch = [0u8; 512];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = inner.read(&mut scratch) => read,
        };
        match read {
            Ok(0) | Err(_) => {
                cancel.cancel();
                return;
            }
            Ok(_) => {}
        }
    }
}
