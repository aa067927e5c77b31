//! Container naming and user identity handling.
//!
//! Every container the hub owns is named `PREFIX + normalize(user)`; the
//! normalization is backend-specific, so handlers never build names directly.

/// Namespace prefix for every container the hub manages.
pub const CONTAINER_NAME_PREFIX: &str = "tds-";

/// Username suffix requesting GPU scheduling.
const GPU_SUFFIX: &str = "_gpu";

/// Whether a user identity opts into GPU scheduling.
pub fn gpu_requested(user: &str) -> bool {
    user.ends_with(GPU_SUFFIX)
}

/// Validate user identity format before it reaches the directory or the
/// orchestrator: alphanumeric plus `_`, `-` and `.`, bounded length.
pub fn validate_user_id(user: &str) -> bool {
    if user.is_empty() || user.len() > 64 {
        return false;
    }

    user.chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Normalization for the single-host daemon: keep the characters the daemon
/// accepts, drop everything else, bounded to the daemon's name limit.
pub fn normalize_for_daemon(user: &str) -> String {
    user.chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
        .take(63)
        .collect()
}

/// Normalization for the cluster scheduler, which requires DNS-1123 labels:
/// lowercase, hyphens instead of underscores and dots, no leading/trailing
/// hyphen.
pub fn normalize_for_cluster(user: &str) -> String {
    let mapped: String = user
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').chars().take(63).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_suffix() {
        assert!(gpu_requested("paula_gpu"));
        assert!(!gpu_requested("paula"));
        assert!(!gpu_requested("gpu_paula"));
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("free_user"));
        assert!(validate_user_id("user-1.a"));
        assert!(!validate_user_id(""));
        assert!(!validate_user_id("user;id"));
        assert!(!validate_user_id(&"x".repeat(65)));
    }

    #[test]
    fn test_normalize_for_daemon_is_idempotent() {
        let once = normalize_for_daemon("free user!");
        assert_eq!(once, "freeuser");
        assert_eq!(normalize_for_daemon(&once), once);
    }

    #[test]
    fn test_normalize_for_cluster() {
        assert_eq!(normalize_for_cluster("Free_User"), "free-user");
        assert_eq!(normalize_for_cluster("paula_gpu"), "paula-gpu");
        assert_eq!(normalize_for_cluster("_edge_"), "edge");
    }

    #[test]
    fn test_cluster_normalization_is_idempotent() {
        let once = normalize_for_cluster("A.b_C");
        assert_eq!(normalize_for_cluster(&once), once);
    }
}
