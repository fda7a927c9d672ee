//! Leaf Net - Protected Outbound Networking
//!
//! Socket-level plumbing shared by the proxy engine and the DoH runtime:
//! - [`SocketProtector`]: host callback that keeps outbound sockets out of the TUN
//! - [`ProtectedDialer`]: TCP connect with protection applied first
//! - [`FragmentStream`]: TLS record fragmentation for the first writes

mod dialer;
mod fragment;
mod protect;

pub use dialer::{DialError, DialerConfig, ProtectedDialer};
pub use fragment::FragmentStream;
pub use protect::{protect_socket, NoopProtector, SocketHandle, SocketProtector, PROTECT_TIMEOUT};
