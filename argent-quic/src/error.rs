//! Error types for the transport core.
//!
//! Protocol errors carry a QUIC transport error code (RFC 9000 Section 20)
//! plus a human-readable reason; the connection's step function is the one
//! place such an error is converted into the `Closing` transition.

use thiserror::Error;

/// QUIC transport error codes per RFC 9000 Section 20.1.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// No error (0x00).
    #[error("no error")]
    NoError,

    /// Internal error (0x01).
    #[error("internal error")]
    InternalError,

    /// Connection refused (0x02).
    #[error("connection refused")]
    ConnectionRefused,

    /// Flow control error (0x03).
    #[error("flow control error")]
    FlowControlError,

    /// Stream limit error (0x04).
    #[error("stream limit error")]
    StreamLimitError,

    /// Stream state error (0x05).
    #[error("stream state error")]
    StreamStateError,

    /// Final size error (0x06).
    #[error("final size error")]
    FinalSizeError,

    /// Frame encoding error (0x07).
    #[error("frame encoding error")]
    FrameEncodingError,

    /// Transport parameter error (0x08).
    #[error("transport parameter error")]
    TransportParameterError,

    /// Connection ID limit error (0x09).
    #[error("connection ID limit error")]
    ConnectionIdLimitError,

    /// Protocol violation (0x0a).
    #[error("protocol violation")]
    ProtocolViolation,

    /// Invalid token (0x0b).
    #[error("invalid token")]
    InvalidToken,

    /// Application error at the transport layer (0x0c).
    #[error("application error")]
    ApplicationError,

    /// Crypto buffer exceeded (0x0d).
    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded,

    /// Key update error (0x0e).
    #[error("key update error")]
    KeyUpdateError,

    /// AEAD limit reached (0x0f).
    #[error("AEAD limit reached")]
    AeadLimitReached,

    /// No viable path (0x10).
    #[error("no viable path")]
    NoViablePath,

    /// TLS alert propagated as a crypto error (0x0100-0x01ff).
    #[error("crypto error, alert {0:#x}")]
    Crypto(u8),
}

impl TransportErrorCode {
    /// Wire representation (RFC 9000 Section 20.1).
    pub fn to_wire(self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::ConnectionRefused => 0x02,
            TransportErrorCode::FlowControlError => 0x03,
            TransportErrorCode::StreamLimitError => 0x04,
            TransportErrorCode::StreamStateError => 0x05,
            TransportErrorCode::FinalSizeError => 0x06,
            TransportErrorCode::FrameEncodingError => 0x07,
            TransportErrorCode::TransportParameterError => 0x08,
            TransportErrorCode::ConnectionIdLimitError => 0x09,
            TransportErrorCode::ProtocolViolation => 0x0a,
            TransportErrorCode::InvalidToken => 0x0b,
            TransportErrorCode::ApplicationError => 0x0c,
            TransportErrorCode::CryptoBufferExceeded => 0x0d,
            TransportErrorCode::KeyUpdateError => 0x0e,
            TransportErrorCode::AeadLimitReached => 0x0f,
            TransportErrorCode::NoViablePath => 0x10,
            TransportErrorCode::Crypto(alert) => 0x0100 + alert as u64,
        }
    }

    /// Parse a wire error code; unknown codes collapse to `ProtocolViolation`
    /// so a misbehaving peer cannot smuggle an unmapped value further in.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportErrorCode::NoError,
            0x01 => TransportErrorCode::InternalError,
            0x02 => TransportErrorCode::ConnectionRefused,
            0x03 => TransportErrorCode::FlowControlError,
            0x04 => TransportErrorCode::StreamLimitError,
            0x05 => TransportErrorCode::StreamStateError,
            0x06 => TransportErrorCode::FinalSizeError,
            0x07 => TransportErrorCode::FrameEncodingError,
            0x08 => TransportErrorCode::TransportParameterError,
            0x09 => TransportErrorCode::ConnectionIdLimitError,
            0x0a => TransportErrorCode::ProtocolViolation,
            0x0b => TransportErrorCode::InvalidToken,
            0x0c => TransportErrorCode::ApplicationError,
            0x0d => TransportErrorCode::CryptoBufferExceeded,
            0x0e => TransportErrorCode::KeyUpdateError,
            0x0f => TransportErrorCode::AeadLimitReached,
            0x10 => TransportErrorCode::NoViablePath,
            0x0100..=0x01ff => TransportErrorCode::Crypto((code - 0x0100) as u8),
            _ => TransportErrorCode::ProtocolViolation,
        }
    }
}

/// A transport-layer failure: error code, the frame type being processed
/// when the failure was detected (if any), and a short reason string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {reason}")]
pub struct QuicError {
    /// Error code to surface in CONNECTION_CLOSE.
    pub code: TransportErrorCode,

    /// Frame type being processed when the error was raised.
    pub frame_type: Option<u64>,

    /// Human-readable detail; also the CONNECTION_CLOSE reason phrase.
    pub reason: &'static str,
}

impl QuicError {
    pub fn new(code: TransportErrorCode, reason: &'static str) -> Self {
        Self { code, frame_type: None, reason }
    }

    pub fn with_frame_type(code: TransportErrorCode, frame_type: u64, reason: &'static str) -> Self {
        Self { code, frame_type: Some(frame_type), reason }
    }

    pub fn frame_encoding(reason: &'static str) -> Self {
        Self::new(TransportErrorCode::FrameEncodingError, reason)
    }

    pub fn protocol_violation(reason: &'static str) -> Self {
        Self::new(TransportErrorCode::ProtocolViolation, reason)
    }

    pub fn flow_control(reason: &'static str) -> Self {
        Self::new(TransportErrorCode::FlowControlError, reason)
    }

    pub fn final_size(reason: &'static str) -> Self {
        Self::new(TransportErrorCode::FinalSizeError, reason)
    }

    pub fn internal(reason: &'static str) -> Self {
        Self::new(TransportErrorCode::InternalError, reason)
    }
}

pub type Result<T> = core::result::Result<T, QuicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for code in [
            TransportErrorCode::NoError,
            TransportErrorCode::FlowControlError,
            TransportErrorCode::FinalSizeError,
            TransportErrorCode::FrameEncodingError,
            TransportErrorCode::NoViablePath,
            TransportErrorCode::Crypto(0x42),
        ] {
            assert_eq!(TransportErrorCode::from_wire(code.to_wire()), code);
        }
    }

    #[test]
    fn unknown_code_is_protocol_violation() {
        assert_eq!(
            TransportErrorCode::from_wire(0xdead_beef),
            TransportErrorCode::ProtocolViolation
        );
    }

    #[test]
    fn crypto_alert_range() {
        // RFC 9001 Section 4.8: 0x0100 + TLS alert.
        assert_eq!(TransportErrorCode::Crypto(0x28).to_wire(), 0x0128);
        assert_eq!(TransportErrorCode::from_wire(0x01ff), TransportErrorCode::Crypto(0xff));
    }

    #[test]
    fn error_display_carries_reason() {
        let err = QuicError::with_frame_type(TransportErrorCode::FrameEncodingError, 0x02, "ack block underflow");
        assert_eq!(err.to_string(), "frame encoding error: ack block underflow");
        assert_eq!(err.frame_type, Some(0x02));
    }
}
