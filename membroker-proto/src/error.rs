//! Wire-level error taxonomy shared by the broker and its clients.

/// Errors a client can receive from the broker, or vice versa, encoded as
/// small negative integers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(i32)]
pub enum ErrorCode {
    #[error("allocation for internal bookkeeping failed")]
    OutOfMemory = -1,
    #[error("operation not valid for this client's type")]
    BadClientType = -2,
    #[error("I/O error on the wire")]
    Io = -3,
    #[error("response id did not match the request id")]
    BadId = -4,
    #[error("opcode not valid in this direction")]
    BadCode = -5,
    #[error("bad parameter (negative page count)")]
    BadParam = -6,
}

impl ErrorCode {
    const LAST: i32 = Self::BadParam as i32;

    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            -1 => Some(Self::OutOfMemory),
            -2 => Some(Self::BadClientType),
            -3 => Some(Self::Io),
            -4 => Some(Self::BadId),
            -5 => Some(Self::BadCode),
            -6 => Some(Self::BadParam),
            _ => None,
        }
    }
}

/// Sentinel marking a signed return value as an error rather than a
/// legitimate page count, for call sites where both share one return slot.
/// Page counts on this wire are never negative, so in practice a bare
/// negative [`ErrorCode::as_i32`] is already unambiguous; `BAD_PAGES` exists
/// for symmetry with callers that tag explicitly.
pub const BAD_PAGES: i32 = i32::MIN - ErrorCode::LAST;

// Error codes run from `OutOfMemory` (-1) down to `BadParam` (-6, i.e.
// `ErrorCode::LAST`), so a tagged value's offset from `BAD_PAGES` is at most
// `-1 - ErrorCode::LAST`.
const TAGGED_SPREAD: i32 = -1 - ErrorCode::LAST;

/// Tags an error code with the [`BAD_PAGES`] sentinel.
pub const fn tag_bad_pages(err: ErrorCode) -> i32 {
    BAD_PAGES + (err.as_i32() - ErrorCode::LAST)
}

/// Interprets a raw signed return value as either a page count or an error.
pub fn decode_page_result(raw: i32) -> Result<u32, ErrorCode> {
    if raw >= BAD_PAGES && raw <= BAD_PAGES + TAGGED_SPREAD {
        let code = raw - BAD_PAGES + ErrorCode::LAST;
        return Err(ErrorCode::from_i32(code).unwrap_or(ErrorCode::Io));
    }
    if raw < 0 {
        return Err(ErrorCode::from_i32(raw).unwrap_or(ErrorCode::Io));
    }
    Ok(raw as u32)
}
