// Shared-secret authentication and identity announcement

use crate::hub::error::{HubError, ProtocolError, Result};
use crate::hub::frame::{encode_frame, FrameReader};
use sha2::{Digest, Sha256};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the raw secret sent before the first frame
pub const KEY_LEN: usize = 8;

/// Who a client says it is: a logical service path plus an instance uid
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub path: String,
    pub uid: String,
}

impl ClientIdentity {
    pub fn new(path: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uid: uid.into(),
        }
    }

    /// Parse the `"path,uid"` announcement
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.is_empty() {
            return Err(ProtocolError::EmptyBody);
        }
        match text.split_once(',') {
            Some((path, uid)) if !path.is_empty() && !uid.is_empty() && !uid.contains(',') => {
                Ok(Self::new(path, uid))
            }
            _ => Err(ProtocolError::BadIdentity(text.to_string())),
        }
    }

    /// The announcement frame body
    pub fn announcement(&self) -> String {
        format!("{},{}", self.path, self.uid)
    }

    /// Address form used in letter `src`/`dst` fields
    pub fn address(&self) -> String {
        format!("{}?{}", self.path, self.uid)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.uid)
    }
}

/// The configured shared secret
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_LEN]);

impl SharedKey {
    pub fn new(key: &str) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = key.as_bytes().try_into().map_err(|_| {
            HubError::Config(format!(
                "key must be exactly {} bytes, got {}",
                KEY_LEN,
                key.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Compare without short-circuiting on the first differing byte
    pub fn verify(&self, presented: &[u8; KEY_LEN]) -> bool {
        self.0
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Short digest that identifies the key in logs without revealing it
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey({})", self.fingerprint())
    }
}

/// Hub side: read the secret, then the identity frame.
///
/// A wrong secret yields `HubError::Auth`; the caller closes the socket
/// without replying.
pub async fn accept<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    key: &SharedKey,
) -> Result<ClientIdentity> {
    let mut presented = [0u8; KEY_LEN];
    reader.get_mut().read_exact(&mut presented).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HubError::Auth
        } else {
            HubError::Io(e)
        }
    })?;

    if !key.verify(&presented) {
        return Err(HubError::Auth);
    }

    let body = reader
        .read_next()
        .await?
        .ok_or(ProtocolError::MissingIdentity)?;
    let text = String::from_utf8(body).map_err(ProtocolError::from)?;

    Ok(ClientIdentity::parse(&text)?)
}

/// Client side: send the secret and the identity announcement in one write
pub async fn introduce<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &SharedKey,
    identity: &ClientIdentity,
) -> Result<()> {
    let mut hello = Vec::with_capacity(KEY_LEN + 64);
    hello.extend_from_slice(key.as_bytes());
    hello.extend(encode_frame(identity.announcement().as_bytes()));
    writer.write_all(&hello).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_identity_parsing() {
        let id = ClientIdentity::parse("/eeg/monitor,monitor-1").unwrap();
        assert_eq!(id.path, "/eeg/monitor");
        assert_eq!(id.uid, "monitor-1");
        assert_eq!(id.address(), "/eeg/monitor?monitor-1");

        assert!(matches!(ClientIdentity::parse(""), Err(ProtocolError::EmptyBody)));
        assert!(ClientIdentity::parse("/eeg/monitor").is_err());
        assert!(ClientIdentity::parse(",uid").is_err());
        assert!(ClientIdentity::parse("/path,").is_err());
        assert!(ClientIdentity::parse("/path,a,b").is_err());
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(SharedKey::new("12345678").is_ok());
        assert!(matches!(SharedKey::new("1234"), Err(HubError::Config(_))));
        assert!(SharedKey::new("123456789").is_err());
    }

    #[test]
    fn test_key_verify_and_fingerprint() {
        let key = SharedKey::new("12345678").unwrap();
        assert!(key.verify(b"12345678"));
        assert!(!key.verify(b"12345679"));

        let fp = key.fingerprint();
        assert_eq!(fp.len(), 8);
        assert!(!format!("{:?}", key).contains("12345678"));
    }

    #[tokio::test]
    async fn test_accept_after_introduce() {
        let key = SharedKey::new("12345678").unwrap();
        let identity = ClientIdentity::new("/client/keyboardHiker", "keyboard-hiker-1");

        let mut wire = Vec::new();
        introduce(&mut wire, &key, &identity).await.unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire), 1024);
        let accepted = accept(&mut reader, &key).await.unwrap();
        assert_eq!(accepted, identity);
    }

    #[tokio::test]
    async fn test_accept_rejects_wrong_key() {
        let good = SharedKey::new("12345678").unwrap();
        let bad = SharedKey::new("87654321").unwrap();

        let mut wire = Vec::new();
        introduce(&mut wire, &bad, &ClientIdentity::new("/a", "a1")).await.unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire), 1024);
        assert!(matches!(accept(&mut reader, &good).await, Err(HubError::Auth)));
    }

    #[tokio::test]
    async fn test_accept_short_secret_is_auth_failure() {
        let key = SharedKey::new("12345678").unwrap();
        let mut reader = FrameReader::new(Cursor::new(b"1234".to_vec()), 1024);
        assert!(matches!(accept(&mut reader, &key).await, Err(HubError::Auth)));
    }

    #[tokio::test]
    async fn test_accept_rejects_empty_identity() {
        let key = SharedKey::new("12345678").unwrap();
        let mut wire = key.as_bytes().to_vec();
        wire.extend(encode_frame(b""));

        let mut reader = FrameReader::new(Cursor::new(wire), 1024);
        let err = accept(&mut reader, &key).await.unwrap_err();
        assert!(matches!(err, HubError::Protocol(ProtocolError::EmptyBody)));
    }

    #[tokio::test]
    async fn test_accept_missing_identity() {
        let key = SharedKey::new("12345678").unwrap();
        let mut reader = FrameReader::new(Cursor::new(key.as_bytes().to_vec()), 1024);
        let err = accept(&mut reader, &key).await.unwrap_err();
        assert!(matches!(err, HubError::Protocol(ProtocolError::MissingIdentity)));
    }
}
