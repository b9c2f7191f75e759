use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, MAX_DATA_SIZE, MAX_LINE_LENGTH, READ_CHUNK};
use super::message::Message;
use super::params::Params;

/// Unit decoded from a connection's input stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Text line without terminator
    Line(String),
    /// Raw bytes announced by a `CHUNK` header
    Chunk { id: u32, channel: usize, data: Bytes },
    /// Line that is not valid UTF-8, decoded lossily
    Invalid(String),
}

/// Pending raw block after a `CHUNK` header
#[derive(Debug, Clone, Copy)]
struct RawBlock {
    id: u32,
    channel: usize,
    len: usize,
}

/// Codec for newline terminated protocol lines interleaved with raw chunks
#[derive(Debug, Default)]
pub struct ProtocolCodec {
    raw: Option<RawBlock>,
    /// Bytes already searched for a terminator
    scanned: usize,
}

impl ProtocolCodec {
    /// Creates a new protocol codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the codec is in the middle of a raw block
    pub fn in_raw_block(&self) -> bool {
        self.raw.is_some()
    }

    fn parse_chunk_header(line: &str) -> Result<RawBlock, Error> {
        let mut params = Params::parse(line)?;
        params.next_str()?;
        let block = RawBlock {
            id: params.next_u32()?,
            channel: params.next_usize()?,
            len: params.next_usize()?,
        };
        params.expect_end()?;
        if block.len > MAX_DATA_SIZE {
            return Err(Error::protocol(format!(
                "Chunk of {} bytes exceeds {} bytes",
                block.len, MAX_DATA_SIZE
            )));
        }
        Ok(block)
    }
}

impl Decoder for ProtocolCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(block) = self.raw {
                if src.len() < block.len {
                    src.reserve((block.len - src.len()).min(READ_CHUNK));
                    return Ok(None);
                }
                self.raw = None;
                let data = src.split_to(block.len).freeze();
                return Ok(Some(Frame::Chunk {
                    id: block.id,
                    channel: block.channel,
                    data,
                }));
            }

            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(Error::protocol(format!(
                        "Line exceeds {} bytes",
                        MAX_LINE_LENGTH
                    )));
                }
                // partial line stays buffered
                self.scanned = src.len();
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            let mut line = src.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }

            let line = match String::from_utf8(line.to_vec()) {
                Ok(line) => line,
                Err(e) => {
                    return Ok(Some(Frame::Invalid(
                        String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    )))
                }
            };

            if line.starts_with("CHUNK ") {
                self.raw = Some(Self::parse_chunk_header(&line)?);
                continue;
            }
            return Ok(Some(Frame::Line(line)));
        }
    }
}

impl Encoder<Frame> for ProtocolCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Line(line) => {
                if line.len() >= MAX_LINE_LENGTH || line.contains('\n') {
                    return Err(Error::protocol("Refusing to send malformed line"));
                }
                dst.reserve(line.len() + 1);
                dst.put_slice(line.as_bytes());
                dst.put_u8(b'\n');
            }
            Frame::Invalid(_) => {
                return Err(Error::protocol("Refusing to send malformed line"));
            }
            Frame::Chunk { id, channel, data } => {
                let header = format!("CHUNK {} {} {}\n", id, channel, data.len());
                dst.reserve(header.len() + data.len());
                dst.put_slice(header.as_bytes());
                dst.put(data);
            }
        }
        Ok(())
    }
}

impl Encoder<Message> for ProtocolCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<Frame>::encode(self, Frame::Line(item.to_line()), dst)
    }
}
