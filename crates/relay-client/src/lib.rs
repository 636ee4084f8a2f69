mod acks;
mod client;
mod wait;

pub use acks::OnlineStatus;
pub use client::{Client, ClientConfig, ClientEvent};
