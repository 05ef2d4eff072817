//! Client side of the adapter: DAP framing, message envelopes and the
//! launch/attach configuration carried by the client.

pub mod args;
pub mod pathmap;
pub mod protocol;
pub mod transport;
