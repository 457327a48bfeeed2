//! # ClusterCSIDriver
//!
//! The operator's own configuration object. The instance named after the
//! driver carries the management state consulted on every reconcile.

use serde::{Deserialize, Serialize};

/// Whether and how the operator manages its operands
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema,
)]
pub enum ManagementState {
    #[default]
    Managed,
    Unmanaged,
    Removed,
    Force,
}

impl ManagementState {
    /// Unmanaged and Removed both leave operands untouched
    #[must_use]
    pub fn is_managed(self) -> bool {
        matches!(self, Self::Managed | Self::Force)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Managed => "Managed",
            Self::Unmanaged => "Unmanaged",
            Self::Removed => "Removed",
            Self::Force => "Force",
        }
    }
}

/// Log verbosity for the operator (`operatorLogLevel`) and its operands (`logLevel`)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema,
)]
pub enum LogLevel {
    #[default]
    Normal,
    Debug,
    Trace,
    TraceAll,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Debug => "Debug",
            Self::Trace => "Trace",
            Self::TraceAll => "TraceAll",
        }
    }

    /// klog `--v` value passed to operand containers
    #[must_use]
    pub fn verbosity(self) -> u8 {
        match self {
            Self::Normal => 2,
            Self::Debug => 4,
            Self::Trace => 6,
            Self::TraceAll => 8,
        }
    }
}

/// ClusterCSIDriver Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: operator.openshift.io/v1
/// kind: ClusterCSIDriver
/// metadata:
///   name: csi.sharedresource.openshift.io
/// spec:
///   managementState: Managed
/// ```
#[derive(
    kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema,
)]
#[kube(
    kind = "ClusterCSIDriver",
    group = "operator.openshift.io",
    version = "v1",
    status = "ClusterCSIDriverStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCSIDriverSpec {
    #[serde(default)]
    pub management_state: ManagementState,
    /// Verbosity of the webhook and node driver containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    /// Verbosity of the operator process itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_log_level: Option<LogLevel>,
    /// Free-form overrides merged into operands by the driver itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsupported_config_overrides: Option<serde_json::Value>,
}

/// Spec handed to every manifest hook
pub type OperatorSpec = ClusterCSIDriverSpec;

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCSIDriverStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub ready_replicas: Option<i32>,
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_management_state_defaults_to_managed() {
        let spec: ClusterCSIDriverSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.management_state, ManagementState::Managed);
        assert!(spec.management_state.is_managed());
    }

    #[test]
    fn test_unmanaged_and_removed_are_not_managed() {
        for state in [ManagementState::Unmanaged, ManagementState::Removed] {
            assert!(!state.is_managed(), "{} should not be managed", state.as_str());
        }
        let spec: ClusterCSIDriverSpec =
            serde_json::from_str(r#"{"managementState":"Unmanaged"}"#).unwrap();
        assert_eq!(spec.management_state, ManagementState::Unmanaged);
    }

    #[test]
    fn test_log_levels_parse_and_map_to_verbosity() {
        let spec: ClusterCSIDriverSpec =
            serde_json::from_str(r#"{"logLevel":"Trace","operatorLogLevel":"Debug"}"#).unwrap();
        assert_eq!(spec.log_level, Some(LogLevel::Trace));
        assert_eq!(spec.operator_log_level, Some(LogLevel::Debug));
        assert_eq!(LogLevel::default().verbosity(), 2);
        assert_eq!(LogLevel::TraceAll.verbosity(), 8);
    }
}
