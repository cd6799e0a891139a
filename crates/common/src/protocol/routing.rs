// Routing metadata codec: one length byte followed by the raw UTF-8
// route name. The length prefix caps route names at 255 bytes; that is
// a wire-format limit, not a tunable.

use thiserror::Error;

/// Hard ceiling on the byte length of a route name.
pub const MAX_ROUTE_LEN: usize = 255;

/// Encoded routing metadata, attached to every outbound operation to
/// tell the server which handler should process the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMetadata(Vec<u8>);

impl RouteMetadata {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route `{route}` is {len} bytes; the length prefix caps routes at {MAX_ROUTE_LEN}")]
    TooLong { route: String, len: usize },

    #[error("routing metadata is empty")]
    Empty,

    #[error("routing metadata truncated: length byte says {expected} bytes, {actual} present")]
    Truncated { expected: usize, actual: usize },

    #[error("routing metadata has {0} trailing bytes after the route name")]
    TrailingBytes(usize),

    #[error("route name is not valid UTF-8")]
    InvalidUtf8,
}

/// Encode a route name as routing metadata.
pub fn encode_route(route: &str) -> Result<RouteMetadata, RouteError> {
    let len = route.len();
    if len > MAX_ROUTE_LEN {
        return Err(RouteError::TooLong { route: route.to_string(), len });
    }
    let mut buf = Vec::with_capacity(1 + len);
    buf.push(len as u8);
    buf.extend_from_slice(route.as_bytes());
    Ok(RouteMetadata(buf))
}

/// Decode routing metadata back into the route name it was built from.
pub fn decode_route(bytes: &[u8]) -> Result<&str, RouteError> {
    let (&len, rest) = bytes.split_first().ok_or(RouteError::Empty)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(RouteError::Truncated { expected: len, actual: rest.len() });
    }
    if rest.len() > len {
        return Err(RouteError::TrailingBytes(rest.len() - len));
    }
    std::str::from_utf8(rest).map_err(|_| RouteError::InvalidUtf8)
}
