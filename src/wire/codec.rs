//! Varint length-delimited message framing, shared by the TCP streams and
//! the on-disk segment format.

use anyhow::{bail, Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest possible length-delimiter varint.
const MAX_DELIMITER_LEN: usize = 10;

/// Encodes a message with its leading length delimiter.
pub fn encode_delimited<M: Message>(msg: &M) -> Bytes {
    Bytes::from(msg.encode_length_delimited_to_vec())
}

/// Attempts to decode one delimited message from `buf`, consuming it on
/// success. Returns `None` when the buffer does not hold a full message yet.
pub fn try_decode<M: Message + Default>(buf: &mut BytesMut) -> Result<Option<M>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut peek = &buf[..];
    let len = match prost::decode_length_delimiter(&mut peek) {
        Ok(len) => len,
        // A truncated varint is indistinguishable from a corrupt one until
        // more bytes arrive; only a full-width delimiter can be rejected.
        Err(_) if buf.len() < MAX_DELIMITER_LEN => return Ok(None),
        Err(e) => return Err(e).context("decoding length delimiter"),
    };

    let delimiter = prost::length_delimiter_len(len);
    if buf.len() < delimiter + len {
        return Ok(None);
    }

    buf.advance(delimiter);
    let msg = M::decode(buf.split_to(len).freeze()).context("decoding message body")?;
    Ok(Some(msg))
}

/// Reads one delimited message from an async stream, buffering partial
/// reads in `buf`. Returns `None` on a clean end of stream.
pub async fn read_delimited<R, M>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<M>>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    loop {
        if let Some(msg) = try_decode(buf)? {
            return Ok(Some(msg));
        }

        let n = reader
            .read_buf(buf)
            .await
            .context("reading delimited message")?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            bail!("stream closed mid-message ({} trailing bytes)", buf.len());
        }
    }
}

/// Drains every remaining delimited message from a fully buffered stream.
pub fn decode_all<M: Message + Default>(data: &[u8]) -> Result<Vec<M>> {
    let mut buf = BytesMut::from(data);
    let mut out = Vec::new();
    while let Some(msg) = try_decode(&mut buf)? {
        out.push(msg);
    }
    if !buf.is_empty() {
        bail!("{} trailing bytes after last message", buf.len());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FrameRecord, ReadoutError};

    fn record(id: i64) -> FrameRecord {
        FrameRecord {
            frame_id: id,
            producer_id: "producer".into(),
            error: ReadoutError::NoError as i32,
            ..Default::default()
        }
    }

    #[test]
    fn test_try_decode_partial_then_complete() {
        let encoded = encode_delimited(&record(42));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..encoded.len() - 3]);
        let partial: Option<FrameRecord> = try_decode(&mut buf).expect("partial decode");
        assert!(partial.is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 3..]);
        let full: FrameRecord = try_decode(&mut buf).expect("decode").expect("message");
        assert_eq!(full.frame_id, 42);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_all_round_trip() {
        let mut stream = Vec::new();
        for id in 0..5 {
            stream.extend_from_slice(&encode_delimited(&record(id)));
        }

        let decoded: Vec<FrameRecord> = decode_all(&stream).expect("decode all");
        assert_eq!(decoded.len(), 5);
        for (i, r) in decoded.iter().enumerate() {
            assert_eq!(r.frame_id, i as i64);
        }
    }

    #[tokio::test]
    async fn test_read_delimited_across_split_reads() {
        let mut stream = Vec::new();
        for id in 0..3 {
            stream.extend_from_slice(&encode_delimited(&record(id)));
        }

        let (mut client, mut server) = tokio::io::duplex(16);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in stream.chunks(7) {
                client.write_all(chunk).await.expect("write chunk");
            }
        });

        let mut buf = BytesMut::new();
        let mut ids = Vec::new();
        while let Some(r) = read_delimited::<_, FrameRecord>(&mut server, &mut buf)
            .await
            .expect("read")
        {
            ids.push(r.frame_id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
