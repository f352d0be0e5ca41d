use crate::common::config::{Config, UpstreamOrigin, SOCKS_PROXY_ENV};
use crate::common::logger;
use crate::proxy::http::ReverseProxy;
use crate::proxy::socks5::Socks5Dialer;
use crate::proxy::tcp::TcpProxy;
use crate::proxy::transport::UpstreamTransport;
use clap::Parser;
use log::LevelFilter;
use std::sync::Arc;
use tokio::net::TcpListener;

mod common;
mod net;
mod proxy;

/// Fallback logger that writes to stderr when log4rs fails to initialise.
struct SimpleLogger {
    level: LevelFilter,
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Reverse proxy to a fixed upstream origin, dialed through SOCKS5
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    #[arg(long, value_name = "ADDRESS")]
    listen_address: Option<String>,

    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(listen_address) = &args.listen_address {
        config.listen_address = listen_address.clone();
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = logger::setup_logger(&config.log) {
        eprintln!("Failed to initialize logger: {}", e);
        let level = logger::level_filter(&config.log.level);
        if log::set_boxed_logger(Box::new(SimpleLogger { level })).is_ok() {
            log::set_max_level(level);
        }
    }

    log::info!("Starting with config: {:?}", config);

    let upstream = match UpstreamOrigin::parse(&config.upstream) {
        Ok(upstream) => upstream,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let socks = config.socks_address();
    if socks.used_default() {
        log::warn!(
            "{} not set, using default SOCKS5 proxy {}",
            SOCKS_PROXY_ENV,
            socks.address
        );
    } else {
        log::info!("Using SOCKS5 proxy {} ({:?})", socks.address, socks.source);
    }

    let dialer = match Socks5Dialer::new(&socks.address) {
        Ok(dialer) => dialer,
        Err(e) => {
            log::error!("Failed to create SOCKS5 dialer: {}", e);
            std::process::exit(1);
        }
    };

    let transport = match UpstreamTransport::new(upstream.clone(), dialer) {
        Ok(transport) => transport,
        Err(e) => {
            log::error!("Failed to create upstream transport: {}", e);
            std::process::exit(1);
        }
    };
    log::info!(
        "Forwarding to {} via SOCKS5 {}",
        upstream.referer(),
        transport.socks_proxy_addr()
    );
    let proxy = Arc::new(ReverseProxy::new(upstream, transport));

    let listener = match TcpListener::bind(&config.listen_address).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind to {}: {}", config.listen_address, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = TcpProxy::new(proxy).run(listener).await {
        log::error!("Server stopped: {}", e);
        std::process::exit(1);
    }
}
