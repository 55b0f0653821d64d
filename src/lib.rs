pub mod classify;
pub mod common;
pub mod config;
pub mod error;
pub mod forward_proxy;
pub mod http1;
pub mod logging;
pub mod lookahead;
pub mod pages;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::{Credential, ProxyConfig};
pub use error::ProxyError;
pub use proxy::ProxyServer;
pub use transport::{Socks5Transport, Transport};
