//! Sitegate - a self-hosted web gateway for multiple virtual hosts
//!
//! This library provides the request path of the gateway:
//! - Resolves the Host header (including aliases) to a configured site
//! - Enforces hierarchical `vAccess.conf` access rules before serving anything
//! - Selects TLS certificates per connection by SNI, with parent-domain fallback
//! - Forwards configured external domains to local backends
//! - Runs scripts through a supervised pool of FastCGI worker processes
//! - Serves static files with index and single-page-app fallback routing

pub mod access;
pub mod certs;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fastcgi;
pub mod proxy;
pub mod server;
pub mod service;
pub mod static_files;
pub mod workers;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
