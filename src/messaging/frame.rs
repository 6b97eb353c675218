use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::RelayError;
use crate::messaging::message::Message;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const DEFAULT_MAX_FRAME_LEN: usize = 16*1024*1024;

/// Length of the frame header, i.e. the u32 (BE) length of the frame body that follows it
pub const FRAME_HEADER_LEN: usize = 4;


/// The receiving half of a framed message channel. Frames are length-prefixed, so a message is
///  only ever decoded once all of its bytes are there.
pub struct FrameReader<R> {
    reader: R,
    max_frame_len: usize,
}

impl <R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(reader: R, max_frame_len: usize) -> FrameReader<R> {
        FrameReader {
            reader,
            max_frame_len,
        }
    }

    /// Waits for the next complete frame. A clean EOF between frames is reported as
    ///  [RelayError::ConnectionClosed], cancellation as [RelayError::Cancelled], and anything
    ///  that can not be decoded as [RelayError::Protocol].
    pub async fn receive(&mut self, cancel: &CancellationToken) -> Result<Message, RelayError> {
        select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            result = self.read_frame() => result,
        }
    }

    async fn read_frame(&mut self) -> Result<Message, RelayError> {
        let mut len_buf = [0u8; FRAME_HEADER_LEN];

        // reading the first byte separately to tell a clean close from a truncated frame
        if self.reader.read(&mut len_buf[..1]).await.map_err(RelayError::from_io)? == 0 {
            return Err(RelayError::ConnectionClosed);
        }
        self.reader.read_exact(&mut len_buf[1..]).await.map_err(truncated)?;

        let frame_len: usize = u32::from_be_bytes(len_buf).safe_cast();
        if frame_len > self.max_frame_len {
            return Err(RelayError::Protocol(format!("received a frame of {} bytes, the configured maximum is {} - closing connection because it is apparently compromised", frame_len, self.max_frame_len)));
        }

        let mut body = BytesMut::zeroed(frame_len);
        self.reader.read_exact(&mut body).await.map_err(truncated)?;

        let message = Message::deser(body.freeze())
            .map_err(|e| RelayError::Protocol(format!("malformed frame: {}", e)))?;
        trace!("received {:?}", message);
        Ok(message)
    }
}

fn truncated(e: io::Error) -> RelayError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RelayError::Protocol("connection closed in the middle of a frame".to_string())
    }
    else {
        RelayError::from_io(e)
    }
}


/// Serializes a message into a complete frame, i.e. prefixed with its length
pub fn encode_frame(message: &Message, max_frame_len: usize) -> Result<BytesMut, RelayError> {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + 32 + message.payload().len());
    buf.put_u32(0);
    message.ser(&mut buf);

    let frame_len = buf.len() - FRAME_HEADER_LEN;
    if frame_len > max_frame_len {
        return Err(RelayError::Protocol(format!("message of {} bytes exceeds the configured maximum frame length of {}", frame_len, max_frame_len)));
    }
    let frame_len: u32 = frame_len.prechecked_cast();
    buf[..FRAME_HEADER_LEN].copy_from_slice(&frame_len.to_be_bytes());
    Ok(buf)
}

/// The sending half of a framed message channel. It can be shared between tasks: each frame is
///  written while holding a lock, so frames from concurrent senders are never interleaved on
///  the wire.
pub struct FrameWriter<W> {
    writer: Mutex<Option<W>>,
    max_frame_len: usize,
}

impl <W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W, max_frame_len: usize) -> FrameWriter<W> {
        FrameWriter {
            writer: Mutex::new(Some(writer)),
            max_frame_len,
        }
    }

    pub async fn send(&self, message: &Message) -> Result<(), RelayError> {
        let buf = encode_frame(message, self.max_frame_len)?;

        let mut lock = self.writer.lock().await;
        let writer = lock.as_mut()
            .ok_or(RelayError::ConnectionClosed)?;

        trace!("sending {:?}", message);
        writer.write_all(&buf).await.map_err(RelayError::from_io)?;
        writer.flush().await.map_err(RelayError::from_io)?;
        Ok(())
    }

    /// Shuts down the write direction. Subsequent sends fail with [RelayError::ConnectionClosed],
    ///  and calling this more than once is a no-op.
    pub async fn shutdown(&self) -> io::Result<()> {
        let writer = self.writer.lock().await.take();
        match writer {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    pub async fn is_shut_down(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}
