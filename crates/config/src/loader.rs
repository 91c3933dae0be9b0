use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::BerthConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["berth.toml"];

/// Load config from the given path.
pub fn load_config(path: &Path) -> Result<BerthConfig, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    toml::from_str(&raw).map_err(|e| format!("failed to parse {}: {e}", path.display()))
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `$BERTH_CONFIG` (explicit path)
/// 2. `./berth.toml` (project-local)
///
/// Returns `BerthConfig::default()` if no config file is found.
#[must_use]
pub fn discover_and_load() -> BerthConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    BerthConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("BERTH_CONFIG") {
        let p = PathBuf::from(explicit);
        if p.exists() {
            return Some(p);
        }
    }

    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    None
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [server]
            bind = "0.0.0.0"
            port = 8500
            base_domain = "ws.example.dev"

            [database]
            url = "sqlite:/var/lib/berth/berth.db"

            [quotas]
            enforce_daily_quota = false
            admin_emails = ["ops@example.dev"]

            [oauth_providers.anthropic]
            client_id = "cid"
            device_code_url = "https://auth.example.com/device/code"
            token_url = "https://auth.example.com/token"
            "#
        )
        .unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.server.base_domain, "ws.example.dev");
        assert!(!cfg.quotas.enforce_daily_quota);
        assert_eq!(
            cfg.oauth_providers["anthropic"].token_url,
            "https://auth.example.com/token"
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "server = 12").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
