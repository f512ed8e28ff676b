//! Length-prefixed framing, plaintext or AEAD protected.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 3 bytes: payload length (big-endian, at most 16,777,215)
//! - N bytes: payload
//!
//! Before the handshake finishes the payload is plaintext. Once a
//! [`CipherState`] is installed for a direction, every payload in that
//! direction is AES-256-GCM ciphertext including its 16 byte tag.
//!
//! [`FrameWriter`] and [`FrameReader`] wrap the two halves of a byte stream.
//! The writer serializes callers behind one lock so a frame is always written
//! with a single `write_all` and never interleaves with another.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

use crate::cipher::{CipherPair, CipherState, TAG_LENGTH};
use crate::error::{Error, Result};
use crate::noise::Role;

/// Maximum payload length a frame header can carry.
pub const MAX_FRAME_SIZE: usize = 0xFF_FFFF;

/// Frame header size: a 3 byte length.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Encoder and decoder for plaintext frames over in-memory buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Builds the header for a payload length.
    pub fn header(len: usize) -> Result<[u8; FRAME_HEADER_SIZE]> {
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok([(len >> 16) as u8, (len >> 8) as u8, len as u8])
    }

    /// Reads the payload length from a header.
    pub fn parse_header(header: [u8; FRAME_HEADER_SIZE]) -> usize {
        ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize
    }

    /// Encode a payload into a frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let header = Self::header(payload.len())?;
        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        output.extend_from_slice(&header);
        output.extend_from_slice(payload);
        Ok(output)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns the payload and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Vec<u8>, usize)> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::Truncated {
                needed: FRAME_HEADER_SIZE,
                available: data.len(),
            });
        }
        let len = Self::parse_header([data[0], data[1], data[2]]);
        let total = FRAME_HEADER_SIZE + len;
        if data.len() < total {
            return Err(Error::Truncated {
                needed: total,
                available: data.len(),
            });
        }
        Ok((data[FRAME_HEADER_SIZE..total].to_vec(), total))
    }

    /// Try to decode a frame, returning None if there isn't enough data.
    ///
    /// This is useful for streaming scenarios where you may receive partial frames.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        match self.decode(data) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(Error::Truncated { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Splits every complete frame off the front of `data`.
    ///
    /// Returns the payloads and the number of bytes consumed; a trailing
    /// partial frame is left in place.
    pub fn decode_all(&self, data: &[u8]) -> Result<(Vec<Vec<u8>>, usize)> {
        let mut frames = Vec::new();
        let mut offset = 0;
        while let Some((payload, consumed)) = self.try_decode(&data[offset..])? {
            frames.push(payload);
            offset += consumed;
        }
        Ok((frames, offset))
    }
}

struct WriterInner<W> {
    io: W,
    cipher: Option<CipherState>,
}

/// The sending half of a framed connection.
pub struct FrameWriter<W> {
    inner: Mutex<WriterInner<W>>,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    /// Wraps a byte sink. No cipher is installed.
    pub fn new(io: W) -> Self {
        Self {
            inner: Mutex::new(WriterInner { io, cipher: None }),
        }
    }

    /// Installs the outbound cipher state. Allowed once.
    pub async fn install(&self, cipher: CipherState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.cipher.is_some() {
            return Err(Error::CipherAlreadyInstalled("outbound"));
        }
        inner.cipher = Some(cipher);
        Ok(())
    }

    /// Returns whether frames are encrypted.
    pub async fn is_encrypted(&self) -> bool {
        self.inner.lock().await.cipher.is_some()
    }

    /// Writes raw, unframed bytes. Only valid before a cipher is installed.
    pub async fn write_preamble(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.cipher.is_some() {
            return Err(Error::Handshake(
                "raw bytes cannot be written on an encrypted stream".to_string(),
            ));
        }
        inner.io.write_all(bytes).await?;
        inner.io.flush().await?;
        Ok(())
    }

    /// Writes one frame, encrypting the payload if a cipher is installed.
    ///
    /// Oversized payloads are rejected before anything is written and
    /// without consuming a nonce.
    pub async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let overhead = if inner.cipher.is_some() { TAG_LENGTH } else { 0 };
        let size = payload.len() + overhead;
        let header = FrameCodec::header(size)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + size);
        frame.extend_from_slice(&header);
        match inner.cipher.as_mut() {
            Some(cipher) => frame.extend_from_slice(&cipher.encrypt(payload)?),
            None => frame.extend_from_slice(payload),
        }

        inner.io.write_all(&frame).await?;
        inner.io.flush().await?;
        trace!(len = size, "wrote frame");
        Ok(())
    }

    /// Shuts down the underlying sink.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.lock().await.io.shutdown().await?;
        Ok(())
    }

    /// Returns the wrapped sink.
    pub fn into_inner(self) -> W {
        self.inner.into_inner().io
    }
}

struct ReaderInner<R> {
    io: R,
    cipher: Option<CipherState>,
}

/// The receiving half of a framed connection.
pub struct FrameReader<R> {
    inner: Mutex<ReaderInner<R>>,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    /// Wraps a byte source. No cipher is installed.
    pub fn new(io: R) -> Self {
        Self {
            inner: Mutex::new(ReaderInner { io, cipher: None }),
        }
    }

    /// Installs the inbound cipher state. Allowed once.
    pub async fn install(&self, cipher: CipherState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.cipher.is_some() {
            return Err(Error::CipherAlreadyInstalled("inbound"));
        }
        inner.cipher = Some(cipher);
        Ok(())
    }

    /// Returns whether frames are decrypted.
    pub async fn is_encrypted(&self) -> bool {
        self.inner.lock().await.cipher.is_some()
    }

    /// Reads exactly `len` raw, unframed bytes. Only valid before a cipher
    /// is installed.
    pub async fn read_raw(&self, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        if inner.cipher.is_some() {
            return Err(Error::Handshake(
                "raw bytes cannot be read from an encrypted stream".to_string(),
            ));
        }
        let mut buf = vec![0u8; len];
        inner.io.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads one frame, decrypting it if a cipher is installed.
    pub async fn read_frame(&self) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        inner.io.read_exact(&mut header).await?;
        let len = FrameCodec::parse_header(header);

        let mut payload = vec![0u8; len];
        inner.io.read_exact(&mut payload).await?;
        trace!(len, "read frame");

        match inner.cipher.as_mut() {
            Some(cipher) => cipher.decrypt(&payload),
            None => Ok(payload),
        }
    }

    /// Returns the wrapped source.
    pub fn into_inner(self) -> R {
        self.inner.into_inner().io
    }
}

/// Installs a handshake's cipher states into both halves of a connection,
/// oriented for `role`.
pub async fn install_cipher_pair<R, W>(
    reader: &FrameReader<R>,
    writer: &FrameWriter<W>,
    pair: CipherPair,
    role: Role,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let (inbound, outbound) = pair.into_directions(role);
    reader.install(inbound).await?;
    writer.install(outbound).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding() {
        assert_eq!(FrameCodec::header(0).unwrap(), [0, 0, 0]);
        assert_eq!(FrameCodec::header(0x010203).unwrap(), [1, 2, 3]);
        assert_eq!(FrameCodec::header(MAX_FRAME_SIZE).unwrap(), [0xFF; 3]);
        assert!(matches!(
            FrameCodec::header(MAX_FRAME_SIZE + 1),
            Err(Error::FrameTooLarge { .. })
        ));
        assert_eq!(FrameCodec::parse_header([1, 2, 3]), 0x010203);
    }

    #[test]
    fn test_encode_decode_roundtrip_small() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(&encoded[..3], &[0, 0, 5]);

        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, vec![1, 2, 3, 4, 5]);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_encode_decode_roundtrip_empty() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&[]).unwrap();
        assert_eq!(encoded, vec![0, 0, 0]);
        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(consumed, 3);
    }

    #[test]
    fn test_decode_truncated() {
        let codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&[0, 0]),
            Err(Error::Truncated { .. })
        ));
        assert!(matches!(
            codec.decode(&[0, 0, 4, 1, 2]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_try_decode_partial() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(b"hello").unwrap();
        assert!(codec.try_decode(&encoded[..2]).unwrap().is_none());
        assert!(codec.try_decode(&encoded[..6]).unwrap().is_none());
        let (payload, consumed) = codec.try_decode(&encoded).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_decode_all_leaves_partial_tail() {
        let codec = FrameCodec::new();
        let mut data = codec.encode(b"one").unwrap();
        data.extend(codec.encode(b"two").unwrap());
        let partial = codec.encode(b"three").unwrap();
        data.extend_from_slice(&partial[..4]);

        let (frames, consumed) = codec.decode_all(&data).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(consumed, 12);
    }

    #[tokio::test]
    async fn test_write_frame_at_size_limit() {
        let writer = FrameWriter::new(Vec::new());
        writer.write_frame(&vec![0xAB; MAX_FRAME_SIZE]).await.unwrap();
        let out = writer.into_inner();
        assert_eq!(out.len(), MAX_FRAME_SIZE + FRAME_HEADER_SIZE);
        assert_eq!(&out[..3], &[0xFF, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn test_write_frame_over_limit_writes_nothing() {
        let writer = FrameWriter::new(Vec::new());
        let err = writer
            .write_frame(&vec![0u8; MAX_FRAME_SIZE + 1])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::FrameTooLarge {
                size: 16_777_216,
                max: 16_777_215
            }
        ));
        assert!(writer.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_encrypted_oversize_consumes_no_nonce() {
        let writer = FrameWriter::new(Vec::new());
        writer.install(CipherState::new([1u8; 32])).await.unwrap();

        // Fits in plaintext but not once the tag is added
        let payload = vec![0u8; MAX_FRAME_SIZE - TAG_LENGTH + 1];
        assert!(matches!(
            writer.write_frame(&payload).await,
            Err(Error::FrameTooLarge { .. })
        ));

        let inner = writer.inner.lock().await;
        assert_eq!(inner.cipher.as_ref().map(CipherState::nonce), Some(0));
        assert!(inner.io.is_empty());
    }

    #[tokio::test]
    async fn test_second_install_rejected() {
        let writer = FrameWriter::new(Vec::new());
        writer.install(CipherState::new([1u8; 32])).await.unwrap();
        assert!(matches!(
            writer.install(CipherState::new([2u8; 32])).await,
            Err(Error::CipherAlreadyInstalled("outbound"))
        ));

        let reader = FrameReader::new(&b""[..]);
        reader.install(CipherState::new([1u8; 32])).await.unwrap();
        assert!(matches!(
            reader.install(CipherState::new([2u8; 32])).await,
            Err(Error::CipherAlreadyInstalled("inbound"))
        ));
    }

    #[tokio::test]
    async fn test_preamble_rejected_after_install() {
        let writer = FrameWriter::new(Vec::new());
        writer.write_preamble(b"WA\x06\x03").await.unwrap();
        writer.install(CipherState::new([1u8; 32])).await.unwrap();
        assert!(writer.write_preamble(b"WA").await.is_err());
        assert_eq!(writer.into_inner(), b"WA\x06\x03".to_vec());
    }

    #[tokio::test]
    async fn test_mirrored_framers_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let client_reader = FrameReader::new(client_read);
        let client_writer = FrameWriter::new(client_write);
        let server_reader = FrameReader::new(server_read);
        let server_writer = FrameWriter::new(server_write);

        let k1 = [0x11; 32];
        let k2 = [0x22; 32];
        install_cipher_pair(
            &client_reader,
            &client_writer,
            CipherPair::from_split(k1, k2),
            Role::Initiator,
        )
        .await
        .unwrap();
        install_cipher_pair(
            &server_reader,
            &server_writer,
            CipherPair::from_split(k1, k2),
            Role::Responder,
        )
        .await
        .unwrap();

        for i in 0..4u8 {
            client_writer.write_frame(&[i; 20]).await.unwrap();
            assert_eq!(server_reader.read_frame().await.unwrap(), vec![i; 20]);
            server_writer.write_frame(&[i; 7]).await.unwrap();
            assert_eq!(client_reader.read_frame().await.unwrap(), vec![i; 7]);
        }
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_io() {
        let reader = FrameReader::new(&[0u8, 0, 5, 1, 2][..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_read_frame_tampered_is_crypto() {
        let mut sender = CipherState::new([5u8; 32]);
        let mut ciphertext = sender.encrypt(b"payload").unwrap();
        ciphertext[2] ^= 0x40;
        let wire = FrameCodec::new().encode(&ciphertext).unwrap();

        let reader = FrameReader::new(&wire[..]);
        reader.install(CipherState::new([5u8; 32])).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(Error::Decryption(_))
        ));
    }
}
