//! Credential verification against the directory service.
//!
//! One operation: `verify(user, password)`. The LDAP implementation binds as
//! the user; a development fallback accepts usernames matching a configured
//! pattern with a fixed password when the directory is unreachable.
//! Credentials are never logged.

use async_trait::async_trait;
use ldap3::LdapConnAsync;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::DirectoryConfig;

#[async_trait]
pub trait CredentialChecker: Send + Sync {
    async fn verify(&self, user: &str, password: &str) -> bool;
}

pub struct LdapChecker {
    cfg: DirectoryConfig,
    dev_pattern: Regex,
}

impl LdapChecker {
    pub fn new(cfg: &DirectoryConfig) -> anyhow::Result<Self> {
        let dev_pattern = Regex::new(&cfg.dev_user_pattern)?;
        Ok(Self {
            cfg: cfg.clone(),
            dev_pattern,
        })
    }

    fn bind_dn(&self, user: &str) -> String {
        format!(
            "uid={},ou={},{}",
            user, self.cfg.org_unit, self.cfg.base_dn
        )
    }

    fn dev_fallback(&self, user: &str, password: &str) -> bool {
        let accepted = self.dev_pattern.is_match(user) && password == self.cfg.dev_password;
        if accepted {
            warn!("Directory unreachable; development fallback accepted user {}", user);
        }
        accepted
    }
}

#[async_trait]
impl CredentialChecker for LdapChecker {
    async fn verify(&self, user: &str, password: &str) -> bool {
        // An empty password would turn the bind into an anonymous one, which
        // most servers accept.
        if password.is_empty() {
            return false;
        }

        let url = self.cfg.url();
        match LdapConnAsync::new(&url).await {
            Ok((conn, mut ldap)) => {
                ldap3::drive!(conn);
                let bound = match ldap.simple_bind(&self.bind_dn(user), password).await {
                    Ok(result) => result.success().is_ok(),
                    Err(e) => {
                        debug!("Bind failed for user {}: {}", user, e);
                        false
                    }
                };
                let _ = ldap.unbind().await;
                bound
            }
            Err(e) => {
                warn!("Directory {} unreachable: {}", url, e);
                self.dev_fallback(user, password)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> LdapChecker {
        LdapChecker::new(&DirectoryConfig {
            host: "openldap".to_string(),
            port: 389,
            base_dn: "dc=opendx,dc=org".to_string(),
            org_unit: "slicerhub".to_string(),
            dev_user_pattern: "^free_user.*$".to_string(),
            dev_password: "test".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_bind_dn_layout() {
        let c = checker();
        assert_eq!(
            c.bind_dn("free_user"),
            "uid=free_user,ou=slicerhub,dc=opendx,dc=org"
        );
    }

    #[test]
    fn test_dev_fallback_gating() {
        let c = checker();
        assert!(c.dev_fallback("free_user", "test"));
        assert!(c.dev_fallback("free_user_gpu", "test"));
        assert!(!c.dev_fallback("free_user", "wrong"));
        assert!(!c.dev_fallback("other_user", "test"));
    }
}
