mod exchange;
mod network;
mod protocol;
mod service;
mod utils;

pub use exchange::{
    Correlator, ExchangeChannel, ExchangeClient, ExchangeHandler, ExchangeServer, Invoker,
    LazyClient, NoService, ResponseFuture, RoleTimer, SharedClient, SharedClientPool, TimerEvent,
};
pub use network::{
    Acceptor, AsyncStream, AttrValue, Channel, ChannelState, Connected, Connection, DynStream,
    TcpAcceptor, TcpTransporter, Transporter, READONLY_ATTR,
};
pub use protocol::{
    BinarySerialization, DecodedFrame, Event, ExchangeCodec, Message, Request, RequestBody,
    Response, RpcInvocation, RpcResult, Serialization, SerializationRegistry, Status,
    HEADER_LENGTH, MAGIC,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ClientConfig, DispatchPoolConfig,
    ExchangeConfig, LogGuard, ProtocolConfig, ServerConfig, Shutdown,
};
pub use utils::{DispatchPool, PoolHandler};
