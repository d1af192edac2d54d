//! The scheduler/labor wire protocol: a packed binary header, a staged
//! frame codec, and the conventions both sides must agree on.
//!
//! Every message is `Head` + payload. `length > 0` always holds, so even
//! trivial acks and triggers carry a two-byte payload.

mod codec;
mod head;

pub use codec::{framed, send_bulk, send_message, Frame, FramedSink, FramedStream, HeadCodec};
pub use head::{Head, OpCode, HEAD_LEN, HEAD_MAGIC, HEAD_VERSION};

/// Positive two-byte ack.
pub const PAYLOAD_OK: &[u8] = b"OK";
/// Negative two-byte ack.
pub const PAYLOAD_FAIL: &[u8] = b"FA";
/// Heartbeat trigger payload.
pub const PAYLOAD_HEARTBEAT: &[u8] = b"HB";
/// Calc trigger payload.
pub const PAYLOAD_CALC: &[u8] = b"CA";

/// The identifying payload a labor sends when attaching.
pub const ATTACH_GREETING: &[u8] = b"attach_labor";
/// The ack string the scheduler answers an attach with.
pub const ATTACH_ACK: &[u8] = b"attach_labor ok";

/// Epoch parity convention, shared by scheduler and labor.
///
/// Epochs 1, 3, 5, ... fix the item factors and solve user rows; epochs
/// 2, 4, 6, ... fix the user factors and solve item rows. Equivalently,
/// the side broadcast as fixed on an odd epoch is the item side.
pub fn epoch_solves_users(epochid: u32) -> bool {
    epochid % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_convention() {
        // fixed-side sequence for epochs 1..=4 must be item, user, item, user
        let fixed: Vec<&str> = (1..=4u32)
            .map(|e| if epoch_solves_users(e) { "item" } else { "user" })
            .collect();
        assert_eq!(fixed, vec!["item", "user", "item", "user"]);
    }
}
