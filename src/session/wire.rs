//! Multipart codec and wire envelope for the messaging protocol.
//!
//! Transport framing:
//! ```text
//! ┌───────────┬──────────────────────────────────────────┐
//! │ nparts(4B)│ nparts × ( len (4B u32 BE) │ part bytes )│
//! │ u32 BE    │                                          │
//! └───────────┴──────────────────────────────────────────┘
//! ```
//!
//! Envelope layout inside one frame:
//! ```text
//! [routing ids...] <IDS|MSG> signature header parent metadata content [buffers...]
//! ```
//! The signature is the hex HMAC of the four JSON parts, computed over the
//! exact bytes sent.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::channels::Channel;
use crate::types::{Error, Result};

/// Literal delimiter separating routing prefixes from the signed payload.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Read one multipart frame from the stream.
///
/// Returns the ordered parts. Returns `None` on clean EOF at a frame
/// boundary. `max_parts` and `max_part_bytes` cap the accepted frame shape.
pub async fn read_multipart<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_parts: u32,
    max_part_bytes: u32,
) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    // Read 4-byte part count
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let nparts = u32::from_be_bytes(count_buf);
    if nparts == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Empty frame: zero parts",
        ));
    }
    if nparts > max_parts {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too wide: {} parts", nparts),
        ));
    }

    let mut parts = Vec::with_capacity(nparts as usize);
    for _ in 0..nparts {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let part_len = u32::from_be_bytes(len_buf);
        if part_len > max_part_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Part too large: {} bytes", part_len),
            ));
        }
        let mut part = vec![0u8; part_len as usize];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }

    Ok(Some(parts))
}

/// Write one multipart frame to the stream.
pub async fn write_multipart<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    parts: &[Vec<u8>],
) -> std::io::Result<()> {
    writer.write_all(&(parts.len() as u32).to_be_bytes()).await?;
    for part in parts {
        writer.write_all(&(part.len() as u32).to_be_bytes()).await?;
        writer.write_all(part).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// One message split into its envelope positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Routing prefixes preceding the delimiter. Not signed.
    pub identities: Vec<Vec<u8>>,
    /// Hex HMAC of the four JSON parts; empty when signing is disabled.
    pub signature: String,
    pub header: Vec<u8>,
    pub parent_header: Vec<u8>,
    pub metadata: Vec<u8>,
    pub content: Vec<u8>,
    /// Opaque binary buffers trailing the JSON parts. Not signed.
    pub buffers: Vec<Vec<u8>>,
}

impl WireFrame {
    /// Split raw parts into envelope positions.
    ///
    /// Fails with `MalformedFrame` when the delimiter is absent, the
    /// signature is not UTF-8, or fewer than four JSON parts follow it.
    pub fn split(parts: Vec<Vec<u8>>, channel: Channel) -> Result<Self> {
        let delim_idx = parts
            .iter()
            .position(|p| p == DELIMITER)
            .ok_or_else(|| Error::malformed_frame(channel, "missing <IDS|MSG> delimiter"))?;

        // signature + four JSON parts after the delimiter
        if parts.len() < delim_idx + 6 {
            return Err(Error::malformed_frame(
                channel,
                format!(
                    "expected signature and 4 parts after delimiter, found {}",
                    parts.len() - delim_idx - 1
                ),
            ));
        }

        let mut iter = parts.into_iter();
        let identities: Vec<Vec<u8>> = iter.by_ref().take(delim_idx).collect();
        let _delimiter = iter.next();

        let signature = String::from_utf8(iter.next().unwrap_or_default())
            .map_err(|_| Error::malformed_frame(channel, "signature is not UTF-8"))?;

        let header = iter.next().unwrap_or_default();
        let parent_header = iter.next().unwrap_or_default();
        let metadata = iter.next().unwrap_or_default();
        let content = iter.next().unwrap_or_default();
        let buffers: Vec<Vec<u8>> = iter.collect();

        Ok(Self {
            identities,
            signature,
            header,
            parent_header,
            metadata,
            content,
            buffers,
        })
    }

    /// Reassemble the envelope into ordered wire parts.
    pub fn assemble(&self) -> Vec<Vec<u8>> {
        let mut parts =
            Vec::with_capacity(self.identities.len() + 6 + self.buffers.len());
        parts.extend(self.identities.iter().cloned());
        parts.push(DELIMITER.to_vec());
        parts.push(self.signature.as_bytes().to_vec());
        parts.push(self.header.clone());
        parts.push(self.parent_header.clone());
        parts.push(self.metadata.clone());
        parts.push(self.content.clone());
        parts.extend(self.buffers.iter().cloned());
        parts
    }

    /// The four byte strings covered by the signature, in signing order.
    pub fn signable_parts(&self) -> [&[u8]; 4] {
        [
            &self.header,
            &self.parent_header,
            &self.metadata,
            &self.content,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    const MAX_PARTS: u32 = 64;
    const MAX_PART: u32 = 64 * 1024 * 1024;

    fn envelope_parts() -> Vec<Vec<u8>> {
        vec![
            b"router-id".to_vec(),
            DELIMITER.to_vec(),
            b"cafe01".to_vec(),
            b"{\"msg_type\":\"x\"}".to_vec(),
            b"{}".to_vec(),
            b"{}".to_vec(),
            b"{\"code\":\"1+1\"}".to_vec(),
            vec![0u8, 1, 2, 255],
        ]
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let parts = envelope_parts();
        let mut buf = Vec::new();
        write_multipart(&mut buf, &parts).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let back = read_multipart(&mut cursor, MAX_PARTS, MAX_PART)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back, parts);
    }

    #[tokio::test]
    async fn test_read_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_multipart(&mut cursor, MAX_PARTS, MAX_PART).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_read_zero_parts_rejected() {
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        let err = read_multipart(&mut cursor, MAX_PARTS, MAX_PART)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_too_many_parts_rejected() {
        let mut cursor = Cursor::new((MAX_PARTS + 1).to_be_bytes().to_vec());
        let err = read_multipart(&mut cursor, MAX_PARTS, MAX_PART)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("too wide"));
    }

    #[tokio::test]
    async fn test_read_oversized_part_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&(MAX_PART + 1).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_multipart(&mut cursor, MAX_PARTS, MAX_PART)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_read_truncated_part() {
        // Declare one 100-byte part but provide 5 bytes
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4, 5]);
        let mut cursor = Cursor::new(buf);
        let err = read_multipart(&mut cursor, MAX_PARTS, MAX_PART)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_split_assemble_round_trip() {
        let frame = WireFrame::split(envelope_parts(), Channel::Shell).unwrap();
        assert_eq!(frame.identities, vec![b"router-id".to_vec()]);
        assert_eq!(frame.signature, "cafe01");
        assert_eq!(frame.buffers, vec![vec![0u8, 1, 2, 255]]);
        assert_eq!(frame.assemble(), envelope_parts());
    }

    #[test]
    fn test_split_no_identities() {
        let parts = envelope_parts()[1..].to_vec();
        let frame = WireFrame::split(parts, Channel::Iopub).unwrap();
        assert!(frame.identities.is_empty());
    }

    #[test]
    fn test_split_missing_delimiter() {
        let parts = vec![b"a".to_vec(), b"b".to_vec()];
        let err = WireFrame::split(parts, Channel::Shell).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame { .. }));
        assert!(err.to_string().contains("delimiter"));
    }

    #[test]
    fn test_split_too_few_parts() {
        let parts = vec![DELIMITER.to_vec(), b"sig".to_vec(), b"{}".to_vec()];
        let err = WireFrame::split(parts, Channel::Shell).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame { .. }));
    }

    #[test]
    fn test_split_non_utf8_signature() {
        let parts = vec![
            DELIMITER.to_vec(),
            vec![0xFF, 0xFE],
            b"{}".to_vec(),
            b"{}".to_vec(),
            b"{}".to_vec(),
            b"{}".to_vec(),
        ];
        let err = WireFrame::split(parts, Channel::Shell).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    // Property-based fuzz tests
    proptest! {
        #[test]
        fn fuzz_read_arbitrary_bytes(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            // read_multipart must never panic on arbitrary input
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let mut cursor = Cursor::new(data);
                let _ = read_multipart(&mut cursor, MAX_PARTS, MAX_PART).await;
            });
        }

        #[test]
        fn fuzz_write_read_round_trip(
            parts in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..256),
                1..16,
            )
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let mut buf = Vec::new();
                write_multipart(&mut buf, &parts).await.unwrap();
                let mut cursor = Cursor::new(buf);
                let back = read_multipart(&mut cursor, MAX_PARTS, MAX_PART)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(back, parts);
            });
        }

        #[test]
        fn fuzz_split_never_panics(
            parts in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64),
                0..12,
            )
        ) {
            let _ = WireFrame::split(parts, Channel::Shell);
        }
    }
}
