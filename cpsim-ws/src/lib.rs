#![forbid(unsafe_code)]

mod connector;

pub use connector::{DEFAULT_CONNECT_TIMEOUT, WsConnection, WsConnector};
