//! Metering and quota: per-user daily minute counters, usage sessions,
//! monthly run counters, and the dynamic system configuration they read.

pub mod quota;
pub mod system_config;
pub mod usage;

pub use {
    quota::{RunQuota, RunQuotaStore},
    system_config::{SystemConfigKey, SystemConfigStore},
    usage::{DailyUsage, QuotaPolicy, UsageSessionRow, UsageStore},
};
