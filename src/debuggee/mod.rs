//! Debuggee side of the adapter: socket addresses, connections, and the private
//! message protocol spoken with the playbook runner.

pub mod addr;
pub mod launcher;
pub mod pidfile;
pub mod socket;
pub mod tls;
pub mod wire;
