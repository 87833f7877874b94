pub use codec::{DecodedFrame, ExchangeCodec, HEADER_LENGTH, MAGIC};
pub use message::{
    Event, Message, Request, RequestBody, Response, RpcInvocation, RpcResult, Status,
};
pub use serialization::{BinarySerialization, Serialization, SerializationRegistry};

mod codec;
mod message;
mod serialization;
