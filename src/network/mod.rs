pub use channel::{AttrValue, Channel, ChannelState, READONLY_ATTR};
pub(crate) use channel::spawn_writer;
pub use connection::Connection;
pub use transporter::{
    Acceptor, AsyncStream, Connected, DynStream, TcpAcceptor, TcpTransporter, Transporter,
};

mod channel;
mod connection;
mod transporter;
