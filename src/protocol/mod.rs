/// Wire formats: the JSON RPC batch codec with its stream framing, and the
/// checksummed device-link datagram.
pub mod codec;
pub mod link;
mod message;

pub use codec::{DecodeError, DecodeErrorKind, DecodedBatch};
pub use link::{packet_type, LinkPacket};
pub use message::{
    error_code, ErrorObject, MethodError, MethodErrorKind, Params, RpcRequest, RpcResponse,
};
