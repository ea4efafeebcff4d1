use serde::{Serialize, Deserialize};
use utoipa::ToSchema;
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Longest slug we accept; slugs end up as a DNS label under the routing domain.
pub const SLUG_MAX_LEN: usize = 63;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct Application {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub last_deployed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One deployed version of an application. Rows are append-only.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct DeployHistory {
    pub id: Uuid,
    pub application_id: Uuid,
    /// Filename the client uploaded the bundle as.
    pub bundle_name: String,
    /// Generated object name the bundle was stored under.
    pub unique_file_name: String,
    pub created_at: DateTime<Utc>,
}

/// Where an uploaded bundle lives in object storage.
///
/// `name` is the generated `<uuid>.zip`; `path` is `<prefix>/<name>` inside the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ArtifactRef { pub name: String, pub path: String }

/// Normalize free-form user input into a slug: lower-case ascii alphanumerics separated by single dashes.
pub fn normalize_slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() { out.push('-'); }
            pending_dash = false;
            out.push(c);
        } else if c == '-' || c == '_' || c == '.' || c.is_whitespace() {
            pending_dash = true;
        }
        // anything else is dropped without introducing a separator
    }
    if out.len() > SLUG_MAX_LEN {
        out.truncate(SLUG_MAX_LEN);
        while out.ends_with('-') { out.pop(); }
    }
    out
}

/// True if `slug` is already in normalized form and non-empty.
pub fn validate_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= SLUG_MAX_LEN
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalize_examples() {
        assert_eq!(normalize_slug("demo"), "demo");
        assert_eq!(normalize_slug("  My App  "), "my-app");
        assert_eq!(normalize_slug("My_Cool.App"), "my-cool-app");
        assert_eq!(normalize_slug("--a  --  b--"), "a-b");
        assert_eq!(normalize_slug("héllo wörld!"), "hllo-wrld");
        assert_eq!(normalize_slug("!!!"), "");
    }

    #[test]
    fn normalize_truncates_to_dns_label() {
        let long = "a".repeat(62) + "-bbbb";
        let s = normalize_slug(&long);
        assert_eq!(s, "a".repeat(62));
        assert!(validate_slug(&s));
    }

    #[test]
    fn validate_rejects_unnormalized() {
        assert!(!validate_slug(""));
        assert!(!validate_slug("Demo"));
        assert!(!validate_slug("-demo"));
        assert!(!validate_slug("de--mo"));
        assert!(!validate_slug("de mo"));
        assert!(validate_slug("demo-2"));
    }

    proptest! {
        #[test]
        fn normalized_is_valid_or_empty(raw in ".{0,100}") {
            let s = normalize_slug(&raw);
            prop_assert!(s.is_empty() || validate_slug(&s), "bad slug {:?} from {:?}", s, raw);
        }

        #[test]
        fn normalize_is_idempotent(raw in "[ a-zA-Z0-9_.-]{0,80}") {
            let once = normalize_slug(&raw);
            prop_assert_eq!(normalize_slug(&once), once);
        }
    }
}
