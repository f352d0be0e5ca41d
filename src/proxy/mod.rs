pub mod http;
pub mod rewrite;
pub mod socks5;
pub mod tcp;
pub mod transport;
