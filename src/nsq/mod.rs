//! Minimal NSQ (TCP protocol V2) client: one consumer connection feeding the
//! relay and one producer connection publishing its results. The consumer
//! can find its nsqd through nsqlookupd.

pub mod consumer;
pub mod frame;
pub mod lookup;
pub mod producer;

pub use consumer::{NsqCommand, NsqConsumer, NsqEvent, keep_alive};
pub use frame::Delivery;
pub use producer::NsqProducer;

/// Topic and channel names nsqd accepts: 1-64 of `[.a-zA-Z0-9_-]`, optionally
/// ending in `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !name.is_empty()
        && name.len() <= 64
        && !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
