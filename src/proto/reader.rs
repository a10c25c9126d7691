//! Buffered PDU reader.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::proto::{ber, Pdu, PduError};

const READ_CHUNK: usize = 16 * 1024;

/// Reads LDAP messages off a byte stream.
///
/// `fill` performs a single read (one readiness cycle); `next_pdu` then
/// drains whatever complete messages that read produced.
#[derive(Debug)]
pub struct PduReader<R> {
    io: R,
    buf: BytesMut,
    max_pdu: usize,
}

impl<R: AsyncRead + Unpin> PduReader<R> {
    pub fn new(io: R, max_pdu: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_pdu,
        }
    }

    /// Read more bytes. Returns `Ok(false)` on a clean end of stream.
    pub async fn fill(&mut self) -> Result<bool, PduError> {
        if self.buf.capacity() - self.buf.len() < READ_CHUNK / 4 {
            self.buf.reserve(READ_CHUNK);
        }
        let n = self.io.read_buf(&mut self.buf).await?;
        if n == 0 {
            if !self.buf.is_empty() {
                return Err(PduError::Truncated);
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Decode the next complete message already in the buffer.
    pub fn next_pdu(&mut self) -> Result<Option<Pdu>, PduError> {
        let header = match ber::read_header(&self.buf)? {
            Some(header) => header,
            None => return Ok(None),
        };
        if header.total_len() > self.max_pdu {
            return Err(PduError::TooLarge {
                size: header.total_len(),
                max: self.max_pdu,
            });
        }
        if self.buf.len() < header.total_len() {
            self.buf.reserve(header.total_len() - self.buf.len());
            return Ok(None);
        }
        let raw = self.buf.split_to(header.total_len()).freeze();
        Pdu::parse(raw).map(Some)
    }

    /// Whether undecoded bytes are buffered.
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{tag, ResultCode};

    #[tokio::test]
    async fn splits_back_to_back_messages() {
        let a = Pdu::result(1, tag::ADD_RESPONSE, ResultCode::Success, "");
        let b = Pdu::abandon(2, 1);
        let mut wire = a.as_bytes().to_vec();
        wire.extend_from_slice(b.as_bytes());

        let mut reader = PduReader::new(&wire[..], 1024);
        assert!(reader.fill().await.unwrap());
        assert_eq!(reader.next_pdu().unwrap().unwrap().msgid(), 1);
        assert_eq!(reader.next_pdu().unwrap().unwrap().msgid(), 2);
        assert!(reader.next_pdu().unwrap().is_none());
        assert!(!reader.fill().await.unwrap());
    }

    #[tokio::test]
    async fn partial_message_waits_for_more() {
        let pdu = Pdu::result(5, tag::ADD_RESPONSE, ResultCode::Success, "done");
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = PduReader::new(rx, 1024);

        use tokio::io::AsyncWriteExt;
        let bytes = pdu.as_bytes().clone();
        tx.write_all(&bytes[..4]).await.unwrap();
        reader.fill().await.unwrap();
        assert!(reader.next_pdu().unwrap().is_none());

        tx.write_all(&bytes[4..]).await.unwrap();
        reader.fill().await.unwrap();
        assert_eq!(reader.next_pdu().unwrap().unwrap().msgid(), 5);
    }

    #[tokio::test]
    async fn oversize_message_is_rejected() {
        let pdu = Pdu::result(5, tag::ADD_RESPONSE, ResultCode::Success, &"x".repeat(200));
        let bytes = pdu.as_bytes().to_vec();
        let mut reader = PduReader::new(&bytes[..], 64);
        reader.fill().await.unwrap();
        assert!(matches!(reader.next_pdu(), Err(PduError::TooLarge { .. })));
    }
}
