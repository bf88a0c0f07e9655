//! Wrap the control protocol's line framing for use with the
//! futures_codec crate.
//!
//! Reply lines are `\r\n`-terminated and begin with a `SSSD` header: three
//! status digits and a separator.  A `+` separator opens a data block that
//! runs until a line consisting of a single `.`; data lines are bytes (tor
//! does not promise UTF-8 there) and a leading `..` unescapes to `.`.

use asynchronous_codec as futures_codec;
use bytes::BytesMut;

use crate::err::Error;
use crate::msg::{parse_header, ReplyLine, Status};

/// One decoded reply line, plus whether it ended its reply set.
#[derive(Clone, Debug)]
pub(crate) struct Frame {
    /// The decoded line.
    pub(crate) line: ReplyLine,
    /// True when the line was `' '`-separated, i.e. the reply is complete.
    pub(crate) last: bool,
}

/// Codec for the control protocol: `String` commands out, [`Frame`]s in.
#[derive(Debug, Default)]
pub(crate) struct ControlCodec {
    /// Decoder state: either between lines, or inside a data block.
    state: DecodeState,
}

/// Decoder state.
#[derive(Debug, Default)]
enum DecodeState {
    /// Expecting a `SSSD` header line.
    #[default]
    Header,
    /// Inside a `+` data block.
    Data {
        /// Status of the line that opened the block.
        status: Status,
        /// Text of the line that opened the block.
        text: String,
        /// Body collected so far, lines joined with `\n`.
        body: Vec<u8>,
        /// Whether any line has been collected yet.
        any: bool,
    },
}

/// Pull one `\r\n`-terminated line off the front of `src`.
fn take_line(src: &mut BytesMut) -> Option<BytesMut> {
    let pos = src.as_ref().windows(2).position(|w| w == b"\r\n")?;
    let mut line = src.split_to(pos + 2);
    line.truncate(pos);
    Some(line)
}

impl futures_codec::Encoder for ControlCodec {
    type Item<'a> = String;
    type Error = Error;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

impl futures_codec::Decoder for ControlCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(raw) = take_line(src) else {
                return Ok(None);
            };
            match std::mem::take(&mut self.state) {
                DecodeState::Header => {
                    let line = std::str::from_utf8(&raw)
                        .map_err(|_| Error::proto("reply line is not UTF-8"))?;
                    let (status, sep, text) = parse_header(line)?;
                    match sep {
                        '+' => {
                            self.state = DecodeState::Data {
                                status,
                                text: text.to_string(),
                                body: Vec::new(),
                                any: false,
                            };
                        }
                        sep => {
                            return Ok(Some(Frame {
                                line: ReplyLine {
                                    status,
                                    text: text.to_string(),
                                    data: None,
                                },
                                last: sep == ' ',
                            }));
                        }
                    }
                }
                DecodeState::Data {
                    status,
                    text,
                    mut body,
                    any,
                } => {
                    if raw.as_ref() == b"." {
                        // A data line continues its reply set; only a
                        // space-separated line can end it.
                        return Ok(Some(Frame {
                            line: ReplyLine {
                                status,
                                text,
                                data: Some(body),
                            },
                            last: false,
                        }));
                    }
                    if any {
                        body.push(b'\n');
                    }
                    // Leading ".." is an escaped ".".
                    let content: &[u8] = match raw.as_ref() {
                        [b'.', b'.', rest @ ..] => {
                            body.push(b'.');
                            rest
                        }
                        all => all,
                    };
                    body.extend_from_slice(content);
                    self.state = DecodeState::Data {
                        status,
                        text,
                        body,
                        any: true,
                    };
                }
            }
        }
    }
}
