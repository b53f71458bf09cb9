//! Length-prefixed framing over async byte streams
//!
//! `<u32 length><u8 kind><payload>` — the length excludes itself and covers
//! the kind byte plus payload. A declared length of zero or beyond
//! MAX_FRAME_SIZE terminates the stream as a protocol violation.

use super::buffer::{WireError, MAX_FRAME_SIZE};
use super::message::Frame;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Serialize a frame including the outer length prefix.
pub fn to_wire(frame: &Frame) -> Vec<u8> {
    let body = frame.encode();
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Read exactly one frame from the stream.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {}", len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let frame = Frame::decode(&body).map_err(|e: WireError| {
        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
    })?;
    Ok(Some(frame))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&to_wire(frame)).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::{
        NextSimTask, RoutedFrame, RoutedMessage,
    };
    use crate::descriptor::EndpointAddress;

    fn sample_frame() -> Frame {
        Frame::Routed(RoutedFrame {
            from: EndpointAddress { participant_id: 1, service_id: 2 },
            link: "default".into(),
            msg: RoutedMessage::NextSimTask(NextSimTask { time_point_ns: 0, duration_ns: 1000 }),
        })
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = sample_frame();
        write_frame(&mut a, &frame).await.unwrap();
        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bit_flipped_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut bytes = to_wire(&sample_frame());
        bytes[3] ^= 0x80; // push the declared length past the frame cap
        tokio::io::AsyncWriteExt::write_all(&mut a, &bytes).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn zero_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &0u32.to_le_bytes()).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }
}
