//! Length-prefixed Diameter framing over a byte stream.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::connection::ConnectionError;
use crate::codec::{DIAMETER_VERSION, HEADER_LEN};

/// Size of the version + length prefix.
const PREFIX_LEN: usize = 4;

/// Validate the version/length prefix and return the total message length.
pub fn frame_length(prefix: [u8; PREFIX_LEN], max_message_size: usize) -> Result<usize, ConnectionError> {
    if prefix[0] != DIAMETER_VERSION {
        return Err(ConnectionError::Framing(format!(
            "unsupported version {}",
            prefix[0]
        )));
    }
    let length = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]) as usize;
    if length < HEADER_LEN {
        return Err(ConnectionError::Framing(format!(
            "length {length} shorter than the header"
        )));
    }
    if length > max_message_size {
        return Err(ConnectionError::Framing(format!(
            "length {length} exceeds limit {max_message_size}"
        )));
    }
    Ok(length)
}

/// Read exactly one message. A clean EOF before the first byte is `Closed`.
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> Result<Bytes, ConnectionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; PREFIX_LEN];
    let first = reader.read(&mut prefix).await?;
    if first == 0 {
        return Err(ConnectionError::Closed);
    }
    reader.read_exact(&mut prefix[first..]).await?;

    let length = frame_length(prefix, max_message_size)?;
    let mut frame = BytesMut::with_capacity(length);
    frame.put_slice(&prefix);
    frame.resize(length, 0);
    reader.read_exact(&mut frame[PREFIX_LEN..]).await?;
    Ok(frame.freeze())
}
