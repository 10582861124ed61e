use serde::{Deserialize, Serialize};

/// Authorization grants carried by a caller.
///
/// Semantics are intentionally strict:
/// - `GlobalAdmin` applies to every tenant and resource.
/// - `TenantAdmin` covers every resource of one tenant, read and write.
/// - `Read`/`Write` with `resource: None` cover every resource of the tenant.
/// - `Read`/`Write` with `resource: Some(..)` match that request type only.
/// - `Write` does not imply `Read`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    Read {
        tenant_id: String,
        #[serde(default)]
        resource: Option<String>,
    },
    Write {
        tenant_id: String,
        #[serde(default)]
        resource: Option<String>,
    },
    TenantAdmin {
        tenant_id: String,
    },
    GlobalAdmin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Permission {
    pub fn allows(&self, tenant_id: &str, resource: &str, access: Access) -> bool {
        match self {
            Permission::GlobalAdmin => true,
            Permission::TenantAdmin { tenant_id: t } => t == tenant_id,
            Permission::Read {
                tenant_id: t,
                resource: r,
            } => {
                access == Access::Read
                    && t == tenant_id
                    && r.as_deref().is_none_or(|r| r == resource)
            }
            Permission::Write {
                tenant_id: t,
                resource: r,
            } => {
                access == Access::Write
                    && t == tenant_id
                    && r.as_deref().is_none_or(|r| r == resource)
            }
        }
    }
}

/// Identity of whoever issued a request. Tenant and user both feed the
/// query cache key, so neither may be shared across principals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallerContext {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default)]
    pub grants: Vec<Permission>,
    // Reserved internal flag: never deserialize from untrusted input.
    #[serde(default, skip_deserializing)]
    internal_system: bool,
}

impl CallerContext {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            grants: Vec::new(),
            internal_system: false,
        }
    }

    pub fn with_grant(mut self, grant: Permission) -> Self {
        self.grants.push(grant);
        self
    }

    /// Caller used by background reloads that run on behalf of the process.
    pub fn system(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: "system".to_string(),
            grants: Vec::new(),
            internal_system: true,
        }
    }

    pub fn is_internal_system(&self) -> bool {
        self.internal_system && self.user_id == "system"
    }

    pub fn is_anonymous(&self) -> bool {
        self.tenant_id.is_empty() || self.user_id.is_empty()
    }

    pub fn can(&self, resource: &str, access: Access) -> bool {
        self.is_internal_system()
            || self
                .grants
                .iter()
                .any(|grant| grant.allows(&self.tenant_id, resource, access))
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, CallerContext, Permission};

    #[test]
    fn resource_scoped_read_does_not_cover_other_resources() {
        let caller = CallerContext::new("t1", "u1").with_grant(Permission::Read {
            tenant_id: "t1".into(),
            resource: Some("GetProductList".into()),
        });
        assert!(caller.can("GetProductList", Access::Read));
        assert!(!caller.can("GetPurchaseRequests", Access::Read));
        assert!(!caller.can("GetProductList", Access::Write));
    }

    #[test]
    fn grants_do_not_cross_tenants() {
        let caller = CallerContext::new("t1", "u1").with_grant(Permission::TenantAdmin {
            tenant_id: "t2".into(),
        });
        assert!(!caller.can("GetProductList", Access::Read));
    }

    #[test]
    fn internal_flag_is_not_deserialized() {
        let json = r#"{"tenant_id":"t1","user_id":"system","internal_system":true}"#;
        let caller: CallerContext = serde_json::from_str(json).expect("decode caller");
        assert!(!caller.is_internal_system());
        assert!(CallerContext::system("t1").is_internal_system());
    }
}
