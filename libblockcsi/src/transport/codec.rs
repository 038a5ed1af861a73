//! Frame codec.
//!
//! ```text
//! [4 bytes] payload length (big-endian u32)
//! [N bytes] JSON payload
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CsiError;

/// Maximum frame length: 16 MiB
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), CsiError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(CsiError::internal)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|l| *l <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            CsiError::TransportError(format!("frame of {} bytes exceeds limit", payload.len()))
        })?;
    writer.write_u32(len).await.map_err(CsiError::transport)?;
    writer.write_all(&payload).await.map_err(CsiError::transport)?;
    writer.flush().await.map_err(CsiError::transport)
}

/// Read one frame.  `Ok(None)` on a clean end of stream before the length.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, CsiError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CsiError::transport(e)),
    };
    if len > MAX_FRAME_LEN {
        return Err(CsiError::TransportError(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(CsiError::transport)?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| CsiError::TransportError(format!("malformed frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CsiMessage, CsiRequest};
    use crate::types::VolumeId;

    #[tokio::test]
    async fn frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &CsiRequest::new(CsiMessage::Probe)).await.unwrap();
        write_frame(&mut a, &CsiRequest::new(CsiMessage::DeleteVolume(VolumeId::from("vol-1"))))
            .await
            .unwrap();
        drop(a);

        let first: CsiRequest = read_frame(&mut b).await.unwrap().unwrap();
        assert!(matches!(first.message, CsiMessage::Probe));
        let second: CsiRequest = read_frame(&mut b).await.unwrap().unwrap();
        assert!(matches!(second.message, CsiMessage::DeleteVolume(_)));
        assert!(read_frame::<_, CsiRequest>(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_FRAME_LEN + 1).await.unwrap();
        let err = read_frame::<_, CsiRequest>(&mut b).await.unwrap_err();
        assert!(matches!(err, CsiError::TransportError(_)));
    }

    #[tokio::test]
    async fn garbage_payload_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(3).await.unwrap();
        a.write_all(b"{x}").await.unwrap();
        assert!(read_frame::<_, CsiRequest>(&mut b).await.is_err());
    }
}
