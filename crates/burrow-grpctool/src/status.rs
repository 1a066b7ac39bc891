//! Status classification helpers.

use tonic::{Code, Status};

/// Whether a status describes the other end of a stream going away rather
/// than a protocol or application failure.
///
/// `Unavailable` and `Cancelled` are what tonic reports when the transport
/// drops. Some transport failures surface as `Internal`/`Unknown` with only
/// the message to go by, so those are matched by substring. The wording
/// belongs to hyper, h2 and rustls and may change between versions; prefer
/// adding codes over adding substrings.
pub fn is_peer_disconnect(status: &Status) -> bool {
    match status.code() {
        Code::Unavailable | Code::Cancelled => return true,
        _ => {}
    }

    let msg = status.message();
    msg.contains("h2 protocol error")
        || msg.contains("broken pipe")
        || msg.contains("connection reset")
        || msg.contains("close_notify")
}

/// Whether the call was abandoned by its own caller: cancelled or past its
/// deadline. Such failures are expected and logged at debug level only.
pub fn request_cancelled(status: &Status) -> bool {
    matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded)
}
