//! Per-tenant capabilities, resolved once per intake and passed down.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MAX_RETRIES;

/// What a tenant is allowed to do.
///
/// Seeded into every workflow context under `tenant`, so conditions can
/// branch on e.g. `tenant.meter_readings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCapabilities {
    pub tenant_id: String,
    #[serde(default)]
    pub display_name: String,
    /// Whether api_action steps may call the partner API.
    #[serde(default = "default_true")]
    pub partner_dispatch: bool,
    /// Whether meter-reading photos are routed for this tenant.
    #[serde(default = "default_true")]
    pub meter_readings: bool,
    /// `max_retries` given to new submissions.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl TenantCapabilities {
    /// Capabilities for a tenant with no stored settings.
    pub fn defaults_for(tenant_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            display_name: tenant_id.clone(),
            tenant_id,
            partner_dispatch: true,
            meter_readings: true,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let caps: TenantCapabilities =
            serde_json::from_str(r#"{"tenant_id": "acme"}"#).unwrap();
        assert!(caps.partner_dispatch);
        assert!(caps.meter_readings);
        assert_eq!(caps.max_retries, 3);
    }
}
