mod lifecycle;
mod names;
mod protocol;

pub use lifecycle::{broker_address, parse_address, socket_address, BROKER_ADDRESS_ENV};
pub use names::{
    CONNECTION_HELLO, DAEMON_CANCEL, DAEMON_GET_CONNECTION, DAEMON_INTERFACE, DAEMON_PATH,
};
pub use protocol::{
    strip_remote_error, Message, Request, RequestId, Response, RpcError, AUTH_FAILED, CANCELLED,
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    REMOTE_ERROR_PREFIX, SERVICE_UNKNOWN, UNKNOWN_OBJECT,
};
