mod frame;
mod key;
mod record;

pub use frame::{Decoded, FrameError, HDR_SIZE, MAX_FRAME, decode, encode, encode_heartbeat};
pub use key::SubscriptionKey;
pub use record::{LogonBody, MsgKind, NackBody, Record, SubscribeBody};
