use std::fmt;

/// Non-I/O errors that may occur while decoding or encoding a message.
///
/// Any decode error makes the receiver drop the datagram; nothing here tears down a running
/// responder or querier.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// The message ended while more data was expected.
    UnexpectedEof,
    /// A domain name pointer did not target an earlier part of the message.
    PointerLoop,
    /// A label length byte used one of the reserved prefixes (`0b01`/`0b10`).
    ReservedValue,
    /// The encode buffer was too small for the whole message.
    ///
    /// Only returned from [`MessageEncoder::finish`]; the truncated message has its TC bit set
    /// and may still be sent.
    ///
    /// [`MessageEncoder::finish`]: super::encoder::MessageEncoder::finish
    Truncated,
    /// An empty label was encountered where it is not allowed.
    EmptyLabel,
    /// A label was longer than 63 bytes.
    LabelTooLong,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::UnexpectedEof => "unexpected end of message",
            Error::PointerLoop => "domain name pointer loop",
            Error::ReservedValue => "reserved label prefix",
            Error::Truncated => "message does not fit the buffer",
            Error::EmptyLabel => "empty label",
            Error::LabelTooLong => "label longer than 63 bytes",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}
