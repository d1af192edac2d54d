//! Length-framed message codec and send helpers.
//!
//! Every message is a fixed-size [`Head`] followed by `head.length` payload
//! bytes. The decoder stages through HEAD then BODY and only yields complete
//! frames, so a handler that rejects a message semantically never has to
//! resynchronize the stream by hand.

use crate::error::SwirlError;
use crate::protocol::head::{Head, OpCode, HEAD_LEN};
use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

/// A complete inbound or outbound message.
pub type Frame = (Head, Bytes);

/// The read half of a connection with framing applied.
pub type FramedStream = FramedRead<ReadHalf<TcpStream>, HeadCodec>;
/// The write half of a connection with framing applied.
pub type FramedSink = FramedWrite<WriteHalf<TcpStream>, HeadCodec>;

enum DecodeState {
    Head,
    Body(Head),
}

/// Codec staging through the packed header and then the declared body.
pub struct HeadCodec {
    state: DecodeState,
}

impl HeadCodec {
    pub fn new() -> Self {
        HeadCodec {
            state: DecodeState::Head,
        }
    }
}

impl Default for HeadCodec {
    fn default() -> Self {
        HeadCodec::new()
    }
}

impl Decoder for HeadCodec {
    type Item = Frame;
    type Error = SwirlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, SwirlError> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if src.len() < HEAD_LEN {
                        src.reserve(HEAD_LEN - src.len());
                        return Ok(None);
                    }
                    let head = Head::read_from(src);
                    if !head.validate() {
                        return Err(SwirlError::BadHeader(head.dump()));
                    }
                    src.reserve(head.length as usize);
                    self.state = DecodeState::Body(head);
                }
                DecodeState::Body(head) => {
                    let len = head.length as usize;
                    if src.len() < len {
                        return Ok(None);
                    }
                    let body = src.split_to(len).freeze();
                    self.state = DecodeState::Head;
                    return Ok(Some((head, body)));
                }
            }
        }
    }
}

impl Encoder<Frame> for HeadCodec {
    type Error = SwirlError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), SwirlError> {
        let (mut head, body) = item;
        debug_assert!(!body.is_empty(), "every message carries a payload");
        head.length = body.len() as u64;
        dst.reserve(HEAD_LEN + body.len());
        head.write_to(dst);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Split a stream into framed read/write halves.
pub fn framed(stream: TcpStream) -> (FramedStream, FramedSink) {
    let (reader, writer) = tokio::io::split(stream);
    (
        FramedRead::new(reader, HeadCodec::new()),
        FramedWrite::new(writer, HeadCodec::new()),
    )
}

/// Send a small control message; every header field other than the opcode
/// and length stays zero.
pub async fn send_message(
    sink: &mut FramedSink,
    code: OpCode,
    payload: &[u8],
) -> Result<(), SwirlError> {
    let head = Head::new(code);
    sink.send((head, Bytes::copy_from_slice(payload))).await
}

/// Send a message with the full set of header fields.
#[allow(clippy::too_many_arguments)]
pub async fn send_bulk(
    sink: &mut FramedSink,
    code: OpCode,
    payload: Bytes,
    taskid: u32,
    epochid: u32,
    nfactors: u32,
    bucket: u32,
    lambda: f64,
    confidence: f64,
) -> Result<(), SwirlError> {
    let mut head = Head::new(code);
    head.taskid = taskid;
    head.epochid = epochid;
    head.nfactors = nfactors;
    head.bucket = bucket;
    head.lambda = lambda;
    head.confidence = confidence;
    sink.send((head, payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(code: OpCode, payload: &[u8]) -> BytesMut {
        let mut codec = HeadCodec::new();
        let mut buf = BytesMut::new();
        let head = Head::new(code);
        codec
            .encode((head, Bytes::copy_from_slice(payload)), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn decode_roundtrip() {
        let buf = encode_frame(OpCode::HeartBeat, b"HB");
        let mut codec = HeadCodec::new();
        let mut src = buf;
        let (head, body) = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(head.opcode(), OpCode::HeartBeat);
        assert_eq!(head.length, 2);
        assert_eq!(&body[..], b"HB");
        assert!(src.is_empty());
    }

    #[test]
    fn decode_is_incremental() {
        let buf = encode_frame(OpCode::SubmitTask, b"/tmp/task.def");
        let mut codec = HeadCodec::new();
        let mut src = BytesMut::new();
        // drip the bytes in one at a time; only the last byte completes
        let mut frames = 0;
        for (i, b) in buf.iter().enumerate() {
            src.extend_from_slice(&[*b]);
            if let Some((head, body)) = codec.decode(&mut src).unwrap() {
                frames += 1;
                assert_eq!(i, buf.len() - 1);
                assert_eq!(head.opcode(), OpCode::SubmitTask);
                assert_eq!(&body[..], b"/tmp/task.def");
            }
        }
        assert_eq!(frames, 1);
    }

    #[test]
    fn decode_back_to_back_frames() {
        let mut src = encode_frame(OpCode::HeartBeat, b"HB");
        src.extend_from_slice(&encode_frame(OpCode::Calc, b"CA"));
        let mut codec = HeadCodec::new();
        let (h1, _) = codec.decode(&mut src).unwrap().unwrap();
        let (h2, _) = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(h1.opcode(), OpCode::HeartBeat);
        assert_eq!(h2.opcode(), OpCode::Calc);
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn corrupted_header_is_terminal() {
        let mut buf = encode_frame(OpCode::HeartBeat, b"HB");
        buf[0] ^= 0xFF; // clobber the magic
        let mut codec = HeadCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(SwirlError::BadHeader(_))
        ));
    }

    #[test]
    fn flipped_version_byte_is_terminal() {
        let mut buf = encode_frame(OpCode::PushRate, &[0u8; 24]);
        buf[2] ^= 0x01; // version byte
        let mut codec = HeadCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(SwirlError::BadHeader(_))
        ));
    }
}
