//! The local tunnel agent: a supervised WebSocket client that exposes local
//! HTTP ports through the platform's public subdomain router.

pub mod login;
pub mod runner;

pub use {
    login::{LoginClient, StartedLogin},
    runner::{AgentConfig, TunnelAgent},
};
