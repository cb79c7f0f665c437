//! Identity-service seam: who is running the apply, and which role sits
//! behind an assumed-role session. Access entries must name the role, not
//! the short-lived session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::util::ProvisionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub caller: CallerIdentity,
    /// The issuing role for assumed-role sessions, otherwise the caller ARN.
    pub principal_arn: String,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn caller_identity(&self) -> Result<CallerIdentity, ProvisionError>;

    async fn session_issuer(&self, session_arn: &str) -> Result<String, ProvisionError>;
}

pub async fn resolve_identity(resolver: &dyn IdentityResolver) -> Result<ResolvedIdentity, ProvisionError> {
    let caller = resolver.caller_identity().await?;
    let principal_arn = if AssumedRoleArn::parse(&caller.arn).is_some() {
        resolver.session_issuer(&caller.arn).await?
    } else {
        caller.arn.clone()
    };
    Ok(ResolvedIdentity {
        caller,
        principal_arn,
    })
}

/// `arn:<partition>:sts::<account>:assumed-role/<role>/<session>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumedRoleArn {
    pub partition: String,
    pub account: String,
    pub role_name: String,
    pub session_name: String,
}

impl AssumedRoleArn {
    pub fn parse(arn: &str) -> Option<Self> {
        let mut fields = arn.splitn(6, ':');
        if fields.next()? != "arn" {
            return None;
        }
        let partition = fields.next()?;
        if fields.next()? != "sts" {
            return None;
        }
        let _region = fields.next()?;
        let account = fields.next()?;
        let resource = fields.next()?;
        let mut parts = resource.splitn(3, '/');
        if parts.next()? != "assumed-role" {
            return None;
        }
        let role_name = parts.next()?;
        let session_name = parts.next()?;
        if role_name.is_empty() || session_name.is_empty() {
            return None;
        }
        Some(Self {
            partition: partition.to_string(),
            account: account.to_string(),
            role_name: role_name.to_string(),
            session_name: session_name.to_string(),
        })
    }

    /// Role ARN without path. Roles created under a path need the identity
    /// service to recover the full ARN.
    pub fn issuer_role_arn(&self) -> String {
        format!(
            "arn:{}:iam::{}:role/{}",
            self.partition, self.account, self.role_name
        )
    }
}

pub fn account_from_arn(arn: &str) -> Option<String> {
    let account = arn.split(':').nth(4)?;
    if account.is_empty() {
        None
    } else {
        Some(account.to_string())
    }
}

/// Resolver backed by a caller ARN taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    caller_arn: Option<String>,
}

impl StaticIdentity {
    pub fn new(caller_arn: Option<String>) -> Self {
        Self { caller_arn }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn caller_identity(&self) -> Result<CallerIdentity, ProvisionError> {
        let arn = self
            .caller_arn
            .clone()
            .ok_or_else(|| ProvisionError::Authentication("no caller session configured".into()))?;
        let account = account_from_arn(&arn)
            .ok_or_else(|| ProvisionError::Authentication(format!("malformed caller ARN {arn}")))?;
        Ok(CallerIdentity {
            user_id: arn.rsplit('/').next().unwrap_or_default().to_string(),
            account,
            arn,
        })
    }

    async fn session_issuer(&self, session_arn: &str) -> Result<String, ProvisionError> {
        AssumedRoleArn::parse(session_arn)
            .map(|session| session.issuer_role_arn())
            .ok_or_else(|| {
                ProvisionError::Authentication(format!("{session_arn} is not an assumed-role session"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assumed_role_session() {
        let arn = "arn:aws:sts::123456789012:assumed-role/Admin/jane@example.com";
        let parsed = AssumedRoleArn::parse(arn).unwrap();
        assert_eq!(parsed.account, "123456789012");
        assert_eq!(parsed.role_name, "Admin");
        assert_eq!(parsed.issuer_role_arn(), "arn:aws:iam::123456789012:role/Admin");
    }

    #[test]
    fn test_plain_user_is_not_a_session() {
        assert!(AssumedRoleArn::parse("arn:aws:iam::123456789012:user/ci").is_none());
        assert!(AssumedRoleArn::parse("not-an-arn").is_none());
    }

    #[tokio::test]
    async fn test_resolves_role_behind_session() {
        let resolver = StaticIdentity::new(Some(
            "arn:aws:sts::123456789012:assumed-role/Deployer/ci-run".into(),
        ));
        let resolved = resolve_identity(&resolver).await.unwrap();
        assert_eq!(resolved.caller.account, "123456789012");
        assert_eq!(resolved.principal_arn, "arn:aws:iam::123456789012:role/Deployer");
    }

    #[tokio::test]
    async fn test_user_principal_is_caller() {
        let resolver = StaticIdentity::new(Some("arn:aws:iam::123456789012:user/ci".into()));
        let resolved = resolve_identity(&resolver).await.unwrap();
        assert_eq!(resolved.principal_arn, "arn:aws:iam::123456789012:user/ci");
    }

    #[tokio::test]
    async fn test_missing_session_is_authentication_error() {
        let resolver = StaticIdentity::default();
        let result = resolve_identity(&resolver).await;
        assert!(matches!(result, Err(ProvisionError::Authentication(_))));
    }
}
