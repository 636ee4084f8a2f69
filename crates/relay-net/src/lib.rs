mod assert;
mod conn;
mod driver;
mod state;
mod timing;

pub use driver::{Driver, PollEvent};
pub use mio::Token;
pub use state::{DisconnectReason, SocketState};
pub use timing::{Repeater, pace};
