//! ezproxy - a reverse proxy configured by the containers it fronts
//!
//! Containers announce themselves through environment variables
//! (`VIRTUAL_HOST`, `VIRTUAL_PORT`, ...). The proxy:
//! - Watches the Docker daemon and keeps a routing table per virtual host
//! - Serves HTTP on port 80 and HTTPS on port 443 with per-domain certificates
//! - Issues certificates on first use, from Let's Encrypt or locally for dev domains
//! - Optionally gates every domain behind one shared basic-auth login
//! - Load balances between containers sharing a domain by priority

pub mod acme;
pub mod auth;
pub mod certs;
pub mod config;
pub mod discovery;
pub mod dns;
pub mod docker;
pub mod domain;
pub mod error;
pub mod local_tls;
pub mod pool;
pub mod proxy;
pub mod routes;
pub mod runtime;
