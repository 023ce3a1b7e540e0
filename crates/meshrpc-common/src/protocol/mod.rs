pub mod endpoint;
pub mod error;
pub mod jsonrpc;
pub mod requests;


pub use endpoint::{Endpoint, ServiceKey, DEFAULT_WEIGHT};
pub use error::{MeshrpcError, Result};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use requests::{Invocation, MethodName, RequestId, RpcArgs};
