use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, ReadHalf};

use crate::network::DynStream;
use crate::protocol::{DecodedFrame, ExchangeCodec};
use crate::AppResult;

/// Read half of one connection: a byte buffer fed from the stream and
/// drained through the codec one frame at a time.
pub struct Connection {
    reader: ReadHalf<DynStream>,
    buffer: BytesMut,
    codec: Arc<ExchangeCodec>,
}

impl Connection {
    pub fn new(reader: ReadHalf<DynStream>, codec: Arc<ExchangeCodec>, buffer_size: usize) -> Connection {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
            codec,
        }
    }

    /// Reads the next frame from the connection.
    ///
    /// Keeps pulling bytes from the stream until the codec can produce
    /// a complete frame. A payload-ceiling violation or unrecoverable
    /// framing error is returned and the connection should be closed.
    ///
    /// If the peer closes the connection gracefully, `None` is
    /// returned. If it closes mid-frame, an error is returned.
    pub async fn read_frame(&mut self) -> AppResult<Option<DecodedFrame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    // peer has closed the connection gracefully
                    Ok(None)
                } else {
                    // peer closed the connection while sending a frame
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}
