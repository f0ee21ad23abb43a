//! 网络层：对端 Socket 传输与输出清洗

pub mod sanitize;
pub mod transport;

pub use sanitize::{default_noise_patterns, Sanitizer};
pub use transport::{PeerTransport, ScriptedTransport, TcpTransport};
