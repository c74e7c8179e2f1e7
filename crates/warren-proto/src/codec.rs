//! Framing codec for the line-oriented node control protocol.
//!
//! A frame is a type-tag line, zero or more `Key=Value` lines, and a
//! terminator: `End`, or `Data` followed immediately by exactly
//! `DataLength` raw payload bytes. Decoding is resumable — a partial
//! frame yields `Ok(None)` and the already-parsed portion is carried in
//! the codec state, so arbitrary chunk boundaries produce the same
//! messages as an unsplit stream.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::message::{keys, Message};

/// Upper bound on a single tag or `Key=Value` line.
const MAX_LINE: usize = 1024 * 1024;
/// Upper bound on a declared payload.
const MAX_PAYLOAD: u64 = 256 * 1024 * 1024;

const TERMINATOR_END: &str = "End";
const TERMINATOR_DATA: &str = "Data";

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Tag,
    Fields(Message),
    Payload {
        message: Message,
        remaining: usize,
    },
}

#[derive(Debug, Default)]
pub struct MessageCodec {
    state: DecodeState,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::Tag => {
                    let Some(line) = take_line(src)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        return Err(CodecError::malformed("empty type tag"));
                    }
                    if line.contains(char::is_whitespace) || line.contains('=') {
                        return Err(CodecError::malformed(format!("invalid type tag: {line:?}")));
                    }
                    self.state = DecodeState::Fields(Message::new(line));
                }
                DecodeState::Fields(mut message) => {
                    let Some(line) = take_line(src)? else {
                        self.state = DecodeState::Fields(message);
                        return Ok(None);
                    };
                    if line == TERMINATOR_END {
                        return Ok(Some(message));
                    }
                    if line == TERMINATOR_DATA {
                        let declared =
                            message.u64_field(keys::DATA_LENGTH).ok_or_else(|| {
                                CodecError::malformed("Data terminator without parseable DataLength")
                            })?;
                        if declared > MAX_PAYLOAD {
                            return Err(CodecError::malformed(format!(
                                "declared payload of {declared} bytes exceeds limit"
                            )));
                        }
                        self.state = DecodeState::Payload {
                            message,
                            remaining: declared as usize,
                        };
                        continue;
                    }
                    let Some((key, value)) = line.split_once('=') else {
                        return Err(CodecError::malformed(format!(
                            "field line without '=': {line:?}"
                        )));
                    };
                    if key.is_empty() {
                        return Err(CodecError::malformed("field line with empty key"));
                    }
                    if message.contains(key) {
                        return Err(CodecError::malformed(format!("duplicate field key: {key:?}")));
                    }
                    message.put(key, value);
                    self.state = DecodeState::Fields(message);
                }
                DecodeState::Payload { mut message, remaining } => {
                    if src.len() < remaining {
                        self.state = DecodeState::Payload { message, remaining };
                        return Ok(None);
                    }
                    message.set_payload(src.split_to(remaining).freeze());
                    return Ok(Some(message));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() && matches!(self.state, DecodeState::Tag) => Ok(None),
            None => Err(CodecError::malformed("truncated frame at end of stream")),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        check_token(item.name(), "type tag")?;
        dst.extend_from_slice(item.name().as_bytes());
        dst.extend_from_slice(b"\n");
        for (key, value) in item.fields() {
            check_key(key)?;
            check_value(value)?;
            dst.extend_from_slice(key.as_bytes());
            dst.extend_from_slice(b"=");
            dst.extend_from_slice(value.as_bytes());
            dst.extend_from_slice(b"\n");
        }
        match item.payload() {
            Some(payload) => {
                let declared = item.u64_field(keys::DATA_LENGTH);
                if declared != Some(payload.len() as u64) {
                    return Err(CodecError::malformed(format!(
                        "DataLength {declared:?} does not match payload of {} bytes",
                        payload.len()
                    )));
                }
                dst.extend_from_slice(b"Data\n");
                dst.extend_from_slice(payload);
            }
            None => dst.extend_from_slice(b"End\n"),
        }
        Ok(())
    }
}

fn take_line(src: &mut BytesMut) -> Result<Option<String>, CodecError> {
    let Some(newline) = src.iter().position(|&b| b == b'\n') else {
        if src.len() > MAX_LINE {
            return Err(CodecError::malformed("line exceeds maximum length"));
        }
        return Ok(None);
    };
    if newline > MAX_LINE {
        return Err(CodecError::malformed("line exceeds maximum length"));
    }
    let line = src.split_to(newline + 1);
    let line = &line[..line.len() - 1];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = std::str::from_utf8(line)
        .map_err(|_| CodecError::malformed("line is not valid utf-8"))?;
    Ok(Some(line.to_owned()))
}

fn check_token(token: &str, what: &str) -> Result<(), CodecError> {
    if token.is_empty() || token.contains(char::is_whitespace) || token.contains('=') {
        return Err(CodecError::malformed(format!("invalid {what}: {token:?}")));
    }
    Ok(())
}

fn check_key(key: &str) -> Result<(), CodecError> {
    if key.is_empty() || key.contains('\n') || key.contains('=') {
        return Err(CodecError::malformed(format!("invalid field key: {key:?}")));
    }
    Ok(())
}

fn check_value(value: &str) -> Result<(), CodecError> {
    if value.contains('\n') {
        return Err(CodecError::malformed(format!(
            "field value contains newline: {value:?}"
        )));
    }
    Ok(())
}

/// Convenience wrapper: encode one message to a standalone buffer.
pub fn encode_message(message: Message) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    MessageCodec::new().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8], chunk: usize) -> Vec<Message> {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for piece in bytes.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(message) = codec.decode(&mut buf).unwrap() {
                out.push(message);
            }
        }
        assert!(buf.is_empty(), "undecoded bytes left over");
        out
    }

    #[test]
    fn encode_plain_frame() {
        let message = Message::new("ClientGet")
            .with_field("Identifier", "job-1")
            .with_field("URI", "CHK@abc");
        let bytes = encode_message(message).unwrap();
        assert_eq!(&bytes[..], b"ClientGet\nIdentifier=job-1\nURI=CHK@abc\nEnd\n");
    }

    #[test]
    fn encode_payload_frame() {
        let message = Message::new("ClientPut")
            .with_field("Identifier", "job-2")
            .with_payload(Bytes::from_static(b"hello"));
        let bytes = encode_message(message).unwrap();
        assert_eq!(
            &bytes[..],
            b"ClientPut\nIdentifier=job-2\nDataLength=5\nData\nhello"
        );
    }

    #[test]
    fn encode_rejects_embedded_newline() {
        let message = Message::new("ClientPut").with_field("URI", "a\nEnd");
        assert!(encode_message(message).is_err());
    }

    #[test]
    fn encode_rejects_mismatched_data_length() {
        let mut message = Message::new("ClientPut").with_payload(Bytes::from_static(b"hello"));
        message.put(keys::DATA_LENGTH, "3");
        assert!(encode_message(message).is_err());
    }

    #[test]
    fn decode_plain_frame() {
        let frames = decode_all(b"NodeHello\nVersion=2.0\nEnd\n", 1024);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is("NodeHello"));
        assert_eq!(frames[0].field("Version"), Some("2.0"));
    }

    #[test]
    fn decode_payload_frame() {
        let frames = decode_all(b"AllData\nIdentifier=job-1\nDataLength=4\nData\nwxyz", 1024);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload().unwrap().as_ref(), b"wxyz");
    }

    #[test]
    fn decode_empty_payload_frame() {
        let frames = decode_all(b"AllData\nDataLength=0\nData\nNodeHello\nEnd\n", 1024);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload().unwrap().len(), 0);
        assert!(frames[1].is("NodeHello"));
    }

    #[test]
    fn decoding_is_chunk_boundary_invariant() {
        let stream: &[u8] = b"NodeHello\nVersion=2.0\nEnd\n\
                              Progress\nIdentifier=job-1\nTotal=128\nSucceeded=64\nEnd\n\
                              AllData\nIdentifier=job-1\nDataLength=6\nData\nabcdef\
                              PutSuccessful\nIdentifier=job-2\nEnd\n";
        let whole = decode_all(stream, stream.len());
        assert_eq!(whole.len(), 4);
        for chunk in [1, 2, 3, 5, 7, 13] {
            assert_eq!(decode_all(stream, chunk), whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn partial_frame_is_retained() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"Progress\nIdentifier=jo"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"b-1\nEnd\n");
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.identifier(), Some("job-1"));
    }

    #[test]
    fn crlf_line_endings_accepted() {
        let frames = decode_all(b"NodeHello\r\nVersion=2.0\r\nEnd\r\n", 4);
        assert_eq!(frames[0].field("Version"), Some("2.0"));
    }

    #[test]
    fn unknown_fields_preserved() {
        let frames = decode_all(b"PersistentPut\nIdentifier=a\nFutureField=seen\nEnd\n", 1024);
        assert_eq!(frames[0].field("FutureField"), Some("seen"));
    }

    #[test]
    fn rejects_field_line_without_separator() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"Progress\nTotal\nEnd\n"[..]);
        assert!(codec.decode(&mut buf).unwrap_err().is_malformed());
    }

    #[test]
    fn rejects_empty_type_tag() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"\nEnd\n"[..]);
        assert!(codec.decode(&mut buf).unwrap_err().is_malformed());
    }

    #[test]
    fn rejects_duplicate_field_key() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"Progress\nTotal=1\nTotal=2\nEnd\n"[..]);
        assert!(codec.decode(&mut buf).unwrap_err().is_malformed());
    }

    #[test]
    fn rejects_data_without_length() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"AllData\nIdentifier=a\nData\nxx"[..]);
        assert!(codec.decode(&mut buf).unwrap_err().is_malformed());
    }

    #[test]
    fn rejects_oversized_payload_declaration() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"AllData\nDataLength=999999999999\nData\n"[..]);
        assert!(codec.decode(&mut buf).unwrap_err().is_malformed());
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"Progress\nIdentifier=job-1\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(codec.decode_eof(&mut buf).is_err());
    }

    #[test]
    fn eof_between_frames_is_clean() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"NodeHello\nEnd\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
