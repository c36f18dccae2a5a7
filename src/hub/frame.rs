// Length-prefixed framing (8-byte big-endian length + payload)

use crate::hub::error::FrameError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 8;

/// Default upper bound for a single frame body
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Prepend the 8-byte big-endian length to `payload`
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Reads whole frames from a byte stream.
///
/// Partial progress lives in the reader, so `read_next` is cancel safe:
/// dropping it mid-frame (e.g. under `timeout`) and calling it again
/// resumes at the same byte.
pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
    header: [u8; FRAME_HEADER_LEN],
    header_read: usize,
    body: Option<Vec<u8>>,
    body_read: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
            header: [0u8; FRAME_HEADER_LEN],
            header_read: 0,
            body: None,
            body_read: 0,
        }
    }

    /// Access the underlying stream, e.g. to read the raw handshake secret
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly on a frame
    /// boundary. A close anywhere inside a frame is `FrameError::Truncated`.
    pub async fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.body.is_none() {
            while self.header_read < FRAME_HEADER_LEN {
                let n = self.reader.read(&mut self.header[self.header_read..]).await?;
                if n == 0 {
                    if self.header_read == 0 {
                        return Ok(None);
                    }
                    return Err(FrameError::Truncated {
                        expected: FRAME_HEADER_LEN,
                        got: self.header_read,
                    });
                }
                self.header_read += n;
            }

            let length = u64::from_be_bytes(self.header);
            self.header_read = 0;
            if length > self.max_frame_bytes as u64 {
                return Err(FrameError::TooLarge {
                    max_frame_bytes: self.max_frame_bytes,
                    got_bytes: length,
                });
            }
            self.body = Some(vec![0u8; length as usize]);
            self.body_read = 0;
        }

        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };
        while self.body_read < body.len() {
            let n = self.reader.read(&mut body[self.body_read..]).await?;
            if n == 0 {
                return Err(FrameError::Truncated {
                    expected: body.len(),
                    got: self.body_read,
                });
            }
            self.body_read += n;
        }

        self.body_read = 0;
        Ok(self.body.take())
    }
}

/// Writes whole frames to a byte stream
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Write one frame; header and body go out in a single buffer
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(frame.len())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[test]
    fn test_encode_prefixes_big_endian_length() {
        let frame = encode_frame(b"abc");
        assert_eq!(&frame[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&frame[8..], b"abc");
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut stream = encode_frame(b"/eeg/monitor,m-1");
        stream.extend(encode_frame(b""));
        stream.extend(encode_frame("héllo".as_bytes()));

        let mut reader = FrameReader::new(Cursor::new(stream), 1024);
        assert_eq!(reader.read_next().await.unwrap().unwrap(), b"/eeg/monitor,m-1");
        assert_eq!(reader.read_next().await.unwrap().unwrap(), b"");
        assert_eq!(reader.read_next().await.unwrap().unwrap(), "héllo".as_bytes());
        assert!(reader.read_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_close_is_none() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), 1024);
        assert!(reader.read_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0, 0]), 1024);
        let err = reader.read_next().await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 8, got: 3 }));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let mut frame = encode_frame(b"0123456789");
        frame.truncate(FRAME_HEADER_LEN + 4);

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let err = reader.read_next().await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 10, got: 4 }));
    }

    #[tokio::test]
    async fn test_rejects_oversize_frame() {
        let frame = encode_frame(&[7u8; 32]);
        let mut reader = FrameReader::new(Cursor::new(frame), 16);
        let err = reader.read_next().await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { got_bytes: 32, .. }));
    }

    #[tokio::test]
    async fn test_read_resumes_after_cancel_mid_frame() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(rx, 1024);
        let frame = encode_frame(b"Echo,1.0,2.0");

        tx.write_all(&frame[..FRAME_HEADER_LEN + 3]).await.unwrap();
        let first = tokio::time::timeout(Duration::from_millis(20), reader.read_next()).await;
        assert!(first.is_err());

        tx.write_all(&frame[FRAME_HEADER_LEN + 3..]).await.unwrap();
        tx.write_all(&encode_frame(b"next")).await.unwrap();
        assert_eq!(reader.read_next().await.unwrap().unwrap(), b"Echo,1.0,2.0");
        assert_eq!(reader.read_next().await.unwrap().unwrap(), b"next");
    }

    #[tokio::test]
    async fn test_read_resumes_after_cancel_mid_header() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(rx, 1024);
        let frame = encode_frame(b"abc");

        tx.write_all(&frame[..5]).await.unwrap();
        let first = tokio::time::timeout(Duration::from_millis(20), reader.read_next()).await;
        assert!(first.is_err());

        tx.write_all(&frame[5..]).await.unwrap();
        assert_eq!(reader.read_next().await.unwrap().unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_writer_output_is_readable() {
        let mut writer = FrameWriter::new(Vec::new());
        let written = writer.write_frame(b"Echo,1.5").await.unwrap();
        assert_eq!(written, 16);

        let bytes = std::mem::take(writer.get_mut());
        let mut reader = FrameReader::new(Cursor::new(bytes), 1024);
        assert_eq!(reader.read_next().await.unwrap().unwrap(), b"Echo,1.5");
    }
}
