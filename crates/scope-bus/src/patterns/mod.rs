//! Communication patterns built from informers and listeners.

pub mod future;
pub mod server;

pub use future::RpcFuture;
pub use server::{
    method_scope, Callback, LocalServer, RemoteServer, ERROR_KEY, REPLY_METHOD, REQUEST_METHOD,
};
