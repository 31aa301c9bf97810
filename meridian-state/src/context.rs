use std::net::IpAddr;

use meridian_store::Scope;

/// Request-scoped values the reconciliation needs besides the report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// What the caller's credential is allowed to act upon
    pub scope: Scope,

    /// Address the report was received from, stored as the device's
    /// public address
    pub client_ip: Option<IpAddr>,
}

impl RequestContext {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            client_ip: None,
        }
    }

    pub fn with_client_ip(self, client_ip: IpAddr) -> Self {
        Self {
            client_ip: Some(client_ip),
            ..self
        }
    }
}
