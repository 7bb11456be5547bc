//! Wire-level constants and framing helpers for the two peer protocols.
//!
//! Transfer protocol (port A): the client sends exactly [`HASH_WIRE_LEN`]
//! bytes of UTF-8 content hash. The server answers with one of three
//! literal error tokens, or a `u32be` relative-path length followed by the
//! path bytes and the raw file bytes.
//!
//! Catalog sync protocol (port B): commands are short literal strings;
//! the passive side streams raw snapshot bytes until EOF.

/// Fixed size of a transfer request: the hex form of a SHA-256 hash.
pub const HASH_WIRE_LEN: usize = 64;

/// Maximum catalog-sync command size read from a peer.
pub const COMMAND_MAX_LEN: usize = 1024;

/// Transfer reply: requester is not a known device.
pub const UNAUTHORIZED: &[u8] = b"UNAUTHORIZED";

/// Transfer reply: hash not present or file missing from disk.
pub const NOT_FOUND: &[u8] = b"NOT_FOUND";

/// Transfer reply: request was empty or not a well-formed hash.
pub const INVALID_REQUEST: &[u8] = b"INVALID_REQUEST";

/// Catalog-sync command: "my catalog changed, pull it from me".
pub const DB_UPDATED: &[u8] = b"DB_UPDATED";

/// Catalog-sync command: "I am pulling, stream me your snapshot".
pub const DB_NOT_UPDATED: &[u8] = b"DB_NOT_UPDATED";

/// Bytes of reply a transfer client reads before deciding the outcome.
pub const REPLY_PREFIX_LEN: usize = 4;

/// Outcome of a transfer request, decided from the reply prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Unauthorized,
    NotFound,
    InvalidRequest,
    /// The prefix is a `u32be` relative-path length; file bytes follow.
    Payload,
}

/// Classify a transfer reply from its first [`REPLY_PREFIX_LEN`] bytes.
///
/// The error literals all start with an uppercase ASCII byte (0x49..=0x55),
/// so a collision with a length header would require a relative path over
/// a gigabyte long. The server never produces one.
pub fn classify_reply(prefix: &[u8; REPLY_PREFIX_LEN]) -> ReplyKind {
    match prefix {
        b"UNAU" => ReplyKind::Unauthorized,
        b"NOT_" => ReplyKind::NotFound,
        b"INVA" => ReplyKind::InvalidRequest,
        _ => ReplyKind::Payload,
    }
}

/// Frame a content hash into the fixed-size request, space-padded.
///
/// Returns `None` when the hash cannot fit (it is not a hash at all).
pub fn encode_hash_request(hash: &str) -> Option<[u8; HASH_WIRE_LEN]> {
    let bytes = hash.as_bytes();
    if bytes.len() > HASH_WIRE_LEN {
        return None;
    }
    let mut frame = [b' '; HASH_WIRE_LEN];
    frame[..bytes.len()].copy_from_slice(bytes);
    Some(frame)
}

/// Recover the hash string from a received request frame.
///
/// Returns `None` when the frame is not UTF-8 or trims to something that
/// is not a well-formed hash.
pub fn decode_hash_request(frame: &[u8; HASH_WIRE_LEN]) -> Option<String> {
    let text = std::str::from_utf8(frame).ok()?;
    let trimmed = text.trim();
    if crate::hash::is_valid_hash(trimmed) {
        Some(trimmed.to_string())
    } else {
        None
    }
}
