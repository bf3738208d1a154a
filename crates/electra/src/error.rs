use media_types::StreamType;

/// Failure reported by a [`SegmentTransport`](crate::demux::SegmentTransport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("network failure: {message}")]
    Network { message: String },

    #[error("read aborted")]
    Aborted,
}

impl TransportError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::status(404, format!("resource not found: {}", resource.into()))
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404 | 410, .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Network { .. } => true,
            Self::Aborted => false,
        }
    }
}

/// Category of a container format error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatErrorKind {
    UnknownContainer,
    MalformedHeader,
    MalformedSample,
    Unsupported,
}

impl FormatErrorKind {
    fn code(&self) -> u32 {
        match self {
            Self::UnknownContainer => 2001,
            Self::MalformedHeader => 2002,
            Self::MalformedSample => 2003,
            Self::Unsupported => 2004,
        }
    }
}

impl std::fmt::Display for FormatErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnknownContainer => "unknown container",
            Self::MalformedHeader => "malformed header",
            Self::MalformedSample => "malformed sample",
            Self::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Errors raised while demultiplexing a segment. All of them end the segment.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DemuxError {
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("format error ({kind}): {reason}")]
    Format {
        kind: FormatErrorKind,
        reason: String,
    },

    #[error("no {stream_type} track in segment")]
    MissingTrack { stream_type: StreamType },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("segment processing cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DemuxError {
    pub fn transport(url: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            url: url.into(),
            source,
        }
    }

    pub fn unknown_container(reason: impl Into<String>) -> Self {
        Self::Format {
            kind: FormatErrorKind::UnknownContainer,
            reason: reason.into(),
        }
    }

    pub fn malformed_header(reason: impl Into<String>) -> Self {
        Self::Format {
            kind: FormatErrorKind::MalformedHeader,
            reason: reason.into(),
        }
    }

    pub fn malformed_sample(reason: impl Into<String>) -> Self {
        Self::Format {
            kind: FormatErrorKind::MalformedSample,
            reason: reason.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Format {
            kind: FormatErrorKind::Unsupported,
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Stable numeric code, grouped in bands by error category.
    ///
    /// | band | category |
    /// |------|----------|
    /// | 1000-1999 | transport (1000 + HTTP status when known) |
    /// | 2000-2999 | container format |
    /// | 3000-3999 | decryption |
    /// | 9000-9999 | internal / cancellation |
    pub fn code(&self) -> u32 {
        match self {
            Self::Transport { source, .. } => match source.http_status() {
                Some(status) if status < 1000 => 1000 + u32::from(status),
                _ => 1000,
            },
            Self::Format { kind, .. } => kind.code(),
            Self::MissingTrack { .. } => 2010,
            Self::Decryption { .. } => 3001,
            Self::Internal { .. } => 9000,
            Self::Cancelled => 9001,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_retryable(),
            Self::Format { .. }
            | Self::MissingTrack { .. }
            | Self::Decryption { .. }
            | Self::Cancelled
            | Self::Internal { .. } => false,
        }
    }
}

impl From<std::io::Error> for DemuxError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Self::malformed_sample(format!("truncated data: {err}"))
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

/// Fatal failures of the decode engine. Recoverable decoder conditions are
/// handled inside the state machine and never surface as this type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to create decoder for `{codec}`: {reason}")]
    DecoderCreation { codec: String, reason: String },

    #[error("failed to convert decoder output: {reason}")]
    OutputConversion { reason: String },

    #[error("decoder output {correlation} has no matching input")]
    UnmatchedOutput { correlation: u64 },

    #[error("decoder error: {reason}")]
    Decoder { reason: String },

    #[error("renderer error: {reason}")]
    Renderer { reason: String },
}

impl DecodeError {
    pub fn decoder_creation(codec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DecoderCreation {
            codec: codec.into(),
            reason: reason.into(),
        }
    }

    pub fn output_conversion(reason: impl Into<String>) -> Self {
        Self::OutputConversion {
            reason: reason.into(),
        }
    }

    pub fn decoder(reason: impl Into<String>) -> Self {
        Self::Decoder {
            reason: reason.into(),
        }
    }

    pub fn renderer(reason: impl Into<String>) -> Self {
        Self::Renderer {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DemuxError::transport("u", TransportError::not_found("u")), 1404)]
    #[case(DemuxError::transport("u", TransportError::network("reset")), 1000)]
    #[case(DemuxError::unknown_container("?"), 2001)]
    #[case(DemuxError::malformed_header("moov"), 2002)]
    #[case(DemuxError::malformed_sample("trun"), 2003)]
    #[case(DemuxError::unsupported("lacing"), 2004)]
    #[case(DemuxError::MissingTrack { stream_type: StreamType::Video }, 2010)]
    #[case(DemuxError::decryption("padding"), 3001)]
    #[case(DemuxError::internal("x"), 9000)]
    #[case(DemuxError::Cancelled, 9001)]
    fn test_error_code_bands(#[case] err: DemuxError, #[case] code: u32) {
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_transport_retryability() {
        assert!(TransportError::status(503, "busy").is_retryable());
        assert!(TransportError::status(429, "slow down").is_retryable());
        assert!(!TransportError::status(403, "forbidden").is_retryable());
        assert!(!TransportError::Aborted.is_retryable());
        assert!(TransportError::not_found("seg.m4s").is_not_found());
        assert!(
            !DemuxError::transport("seg.m4s", TransportError::not_found("seg.m4s")).is_retryable()
        );
    }

    #[test]
    fn test_io_eof_maps_to_malformed_sample() {
        let err: DemuxError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert_eq!(err.code(), 2003);
    }
}
