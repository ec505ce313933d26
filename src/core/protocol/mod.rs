// src/core/protocol/mod.rs

pub mod frame;
pub mod message;
pub mod validate;

pub use frame::{MAX_FRAME_SIZE, WireCodec, encode_to_vec};
pub use message::{
    AdminMessage, AssignedFields, AttachMode, BinaryFrame, BlockKind, EmitMessage, ErrorMessage,
    HandshakeAck, HandshakeMessage, JsonMap, LockMode, MemoryMessage, MemoryOp, Message,
    PROTOCOL_VERSION, PermissionMap, ResponseMessage, ResponseStatus, TriggerMessage,
    bytes_to_value, value_to_bytes,
};
