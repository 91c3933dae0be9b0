//! Subdomain policy: reserved names, plan gating, and generation.

use berth_common::{
    Error, Result,
    types::{HostingType, Plan},
};

/// Names that can never be claimed as workspace subdomains.
pub const RESERVED: &[&str] = &[
    "api", "tunnel", "www", "app", "admin", "dashboard", "cdn", "static", "assets", "mail",
    "email", "ftp", "ssh", "docs", "blog", "status", "support",
];

const GENERATE_ATTEMPTS: usize = 10;

#[must_use]
pub fn is_reserved(subdomain: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(subdomain))
}

/// Whether this plan may pick a custom subdomain for this hosting type.
/// Tunnel customs need `tunnel|pro`; cloud customs need `pro`.
#[must_use]
pub fn plan_allows_custom(plan: Plan, hosting: HostingType) -> bool {
    match hosting {
        HostingType::Local => matches!(plan, Plan::Tunnel | Plan::Pro),
        HostingType::Cloud => plan == Plan::Pro,
    }
}

/// Validate a user-supplied subdomain's shape and reserved-name status.
pub fn validate_custom(subdomain: &str) -> Result<()> {
    let valid_shape = !subdomain.is_empty()
        && subdomain.len() <= 63
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-');
    if !valid_shape {
        return Err(Error::bad_request("invalid subdomain"));
    }
    if is_reserved(subdomain) {
        return Err(Error::bad_request("subdomain is reserved"));
    }
    Ok(())
}

/// Generate `ws-<8-hex>` candidates until `is_taken` clears one, giving up
/// after ten attempts.
pub async fn generate<F, Fut>(is_taken: F) -> Result<String>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for _ in 0..GENERATE_ATTEMPTS {
        let candidate = format!("ws-{}", berth_common::ids::short_hex(4));
        if is_reserved(&candidate) {
            continue;
        }
        if !is_taken(candidate.clone()).await? {
            return Ok(candidate);
        }
    }
    Err(Error::conflict("could not allocate a unique subdomain"))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_are_blocked() {
        assert!(is_reserved("api"));
        assert!(is_reserved("API"));
        assert!(!is_reserved("myapp"));
        assert!(validate_custom("admin").is_err());
        assert!(validate_custom("myapp").is_ok());
    }

    #[test]
    fn shape_is_validated() {
        assert!(validate_custom("").is_err());
        assert!(validate_custom("-leading").is_err());
        assert!(validate_custom("trailing-").is_err());
        assert!(validate_custom("UpperCase").is_err());
        assert!(validate_custom("has_underscore").is_err());
        assert!(validate_custom("ok-name-42").is_ok());
    }

    #[test]
    fn plan_gating() {
        assert!(!plan_allows_custom(Plan::Free, HostingType::Local));
        assert!(plan_allows_custom(Plan::Tunnel, HostingType::Local));
        assert!(plan_allows_custom(Plan::Pro, HostingType::Local));
        assert!(!plan_allows_custom(Plan::Free, HostingType::Cloud));
        assert!(!plan_allows_custom(Plan::Tunnel, HostingType::Cloud));
        assert!(plan_allows_custom(Plan::Pro, HostingType::Cloud));
    }

    #[tokio::test]
    async fn generate_has_expected_shape() {
        let name = generate(|_| async { Ok(false) }).await.unwrap();
        assert!(name.starts_with("ws-"));
        assert_eq!(name.len(), 11);
        assert!(name[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn generate_gives_up_when_everything_is_taken() {
        let err = generate(|_| async { Ok(true) }).await.unwrap_err();
        assert_eq!(err.kind(), berth_common::ErrorKind::Conflict);
    }
}
