//! `${VAR}` and `${VAR:-default}` expansion for config files, applied to the
//! raw text before TOML parsing so secrets never need to live on disk.

/// Expand environment placeholders in a config document.
///
/// `${NAME}` resolves to the variable's value; `${NAME:-fallback}` resolves
/// to the fallback when the variable is unset. A placeholder with no
/// fallback and no value is kept literally so a later validation error
/// points at the offending name.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            // Unterminated placeholder; emit the remainder untouched.
            out.push_str(&rest[start..]);
            return out;
        };

        let inner = &after[..end];
        let (name, fallback) = match inner.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (inner, None),
        };

        let valid_name =
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        match (valid_name, lookup(name), fallback) {
            (true, Some(value), _) => out.push_str(&value),
            (true, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                // Unresolvable or malformed; keep the literal text.
                out.push_str(&rest[start..start + 2 + end + 1]);
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "DB_URL" => Some("sqlite:/srv/berth.db".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn expands_known_variable() {
        assert_eq!(
            substitute_env_with("url = \"${DB_URL}\"", lookup),
            "url = \"sqlite:/srv/berth.db\""
        );
    }

    #[test]
    fn fallback_applies_only_when_unset() {
        assert_eq!(
            substitute_env_with("${MISSING:-sqlite:berth.db}", lookup),
            "sqlite:berth.db"
        );
        assert_eq!(
            substitute_env_with("${DB_URL:-sqlite:berth.db}", lookup),
            "sqlite:/srv/berth.db"
        );
        // Set-but-empty wins over the fallback.
        assert_eq!(substitute_env_with("${EMPTY:-x}", lookup), "");
    }

    #[test]
    fn unresolved_placeholder_is_kept_literally() {
        assert_eq!(substitute_env_with("${MISSING}", lookup), "${MISSING}");
    }

    #[test]
    fn malformed_placeholders_pass_through() {
        assert_eq!(substitute_env_with("${}", lookup), "${}");
        assert_eq!(substitute_env_with("${BAD NAME}", lookup), "${BAD NAME}");
        assert_eq!(substitute_env_with("tail ${OPEN", lookup), "tail ${OPEN");
    }

    #[test]
    fn multiple_placeholders_in_one_document() {
        assert_eq!(
            substitute_env_with("${DB_URL} and ${MISSING:-x} and ${DB_URL}", lookup),
            "sqlite:/srv/berth.db and x and sqlite:/srv/berth.db"
        );
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(substitute_env("bind = \"127.0.0.1\""), "bind = \"127.0.0.1\"");
    }
}
