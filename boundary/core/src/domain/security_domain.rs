// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Security Domain
//!
//! A [`SecurityDomain`] identifies where a script came from (its origin and
//! signers) and what that origin may do. It is an opaque, immutable handle:
//! clones share identity, and equality and hashing are by identity, so two
//! domains built from the same origin are still distinct cache keys.
//!
//! ## Permission Evaluation
//!
//! [`SecurityDomain::implies`] applies, in order (first failure returns an
//! [`AccessViolation`]):
//! 1. Deny list (explicit denies take precedence)
//! 2. Grants, first match wins
//! 3. Deny by default
//!
//! `permission_pattern` supports `"*"`, a prefix wildcard such as `"fs.*"`,
//! and exact names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::error::AccessViolation;

/// A named operation, optionally qualified by a target (path, host, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub name: String,
    pub target: Option<String>,
}

impl Permission {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
        }
    }

    pub fn with_target(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: Some(target.into()),
        }
    }

    /// Reading the ambient execution context.
    pub fn get_context() -> Self {
        Self::new("runtime.getContext")
    }

    /// Creating a new trust boundary below an execution context.
    pub fn create_boundary() -> Self {
        Self::new("runtime.createBoundary")
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}:{}", self.name, target),
            None => f.write_str(&self.name),
        }
    }
}

/// A permission entry granted to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Permission name pattern. Supports exact match and prefix wildcard (`"fs.*"`).
    pub permission_pattern: String,
    /// If set, a permission carrying a target must have that target start with
    /// one of these prefixes.
    pub target_allowlist: Option<Vec<String>>,
}

impl Grant {
    pub fn new(permission_pattern: impl Into<String>) -> Self {
        Self {
            permission_pattern: permission_pattern.into(),
            target_allowlist: None,
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_allowlist = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Evaluate whether `permission` is covered by this grant.
    ///
    /// # Errors
    ///
    /// - `NotGranted`: the permission name does not match `permission_pattern`
    /// - `TargetOutsideAllowlist`: the target is not under `target_allowlist`
    pub fn allows(&self, permission: &Permission, origin: &str) -> Result<(), AccessViolation> {
        if !matches_pattern(&self.permission_pattern, &permission.name) {
            return Err(AccessViolation::NotGranted {
                permission: permission.to_string(),
                origin: origin.to_string(),
            });
        }

        if let (Some(allowlist), Some(target)) = (&self.target_allowlist, &permission.target) {
            if !allowlist.iter().any(|allowed| target.starts_with(allowed.as_str())) {
                return Err(AccessViolation::TargetOutsideAllowlist {
                    permission: permission.name.clone(),
                    target: target.clone(),
                    allowed: allowlist.clone(),
                });
            }
        }

        Ok(())
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == name
}

#[derive(Debug)]
pub(crate) struct DomainInner {
    id: Uuid,
    origin: String,
    signers: Vec<String>,
    grants: Vec<Grant>,
    deny_list: Vec<String>,
}

/// Identity of an origin/trust level that calls are attributed to.
#[derive(Clone)]
pub struct SecurityDomain {
    inner: Arc<DomainInner>,
}

impl SecurityDomain {
    pub fn builder(origin: impl Into<String>) -> SecurityDomainBuilder {
        SecurityDomainBuilder {
            origin: origin.into(),
            signers: Vec::new(),
            grants: Vec::new(),
            deny_list: Vec::new(),
        }
    }

    /// A domain that is granted every permission.
    pub fn all_permissions(origin: impl Into<String>) -> Self {
        Self::builder(origin).grant(Grant::new("*")).build()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn signers(&self) -> &[String] {
        &self.inner.signers
    }

    pub fn grants(&self) -> &[Grant] {
        &self.inner.grants
    }

    /// Evaluate whether this domain is allowed `permission`.
    pub fn implies(&self, permission: &Permission) -> Result<(), AccessViolation> {
        if self
            .inner
            .deny_list
            .iter()
            .any(|pattern| matches_pattern(pattern, &permission.name))
        {
            return Err(AccessViolation::ExplicitlyDenied {
                permission: permission.to_string(),
                origin: self.inner.origin.clone(),
            });
        }

        let mut last_violation = None;
        for grant in &self.inner.grants {
            match grant.allows(permission, &self.inner.origin) {
                Ok(()) => return Ok(()),
                Err(violation @ AccessViolation::TargetOutsideAllowlist { .. }) => {
                    last_violation = Some(violation)
                }
                Err(_) => continue,
            }
        }

        Err(last_violation.unwrap_or_else(|| AccessViolation::NotGranted {
            permission: permission.to_string(),
            origin: self.inner.origin.clone(),
        }))
    }

    /// The domain to use for dynamically generated code. There is no separate
    /// notion of a dynamic domain, so this is the domain itself.
    pub fn dynamic_domain(&self) -> SecurityDomain {
        self.clone()
    }

    pub fn downgrade(&self) -> WeakSecurityDomain {
        WeakSecurityDomain {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<DomainInner> {
        &self.inner
    }
}

impl PartialEq for SecurityDomain {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SecurityDomain {}

impl Hash for SecurityDomain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for SecurityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityDomain")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .finish()
    }
}

/// Non-owning reference to a [`SecurityDomain`].
#[derive(Clone, Debug)]
pub struct WeakSecurityDomain {
    inner: Weak<DomainInner>,
}

impl WeakSecurityDomain {
    pub fn upgrade(&self) -> Option<SecurityDomain> {
        self.inner.upgrade().map(|inner| SecurityDomain { inner })
    }

    pub fn is_released(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

pub struct SecurityDomainBuilder {
    origin: String,
    signers: Vec<String>,
    grants: Vec<Grant>,
    deny_list: Vec<String>,
}

impl SecurityDomainBuilder {
    /// Fingerprint of a certificate that signed the code. Verifying signatures
    /// is the host's responsibility.
    pub fn signer(mut self, fingerprint: impl Into<String>) -> Self {
        self.signers.push(fingerprint.into());
        self
    }

    pub fn grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }

    pub fn deny(mut self, permission_pattern: impl Into<String>) -> Self {
        self.deny_list.push(permission_pattern.into());
        self
    }

    pub fn build(self) -> SecurityDomain {
        SecurityDomain {
            inner: Arc::new(DomainInner {
                id: Uuid::new_v4(),
                origin: self.origin,
                signers: self.signers,
                grants: self.grants,
                deny_list: self.deny_list,
            }),
        }
    }
}
