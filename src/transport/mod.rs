pub mod connection;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
pub mod udp;
pub use connection::{PacketSender, SipConnection};
pub use sip_addr::SipAddr;
pub use tcp::TcpConnection;
pub use tcp_listener::TcpListenerConnection;
pub use udp::UdpConnection;
#[cfg(test)]
pub mod tests;
