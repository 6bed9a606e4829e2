//! The `{"metadata":{...}}` record written once at the start of every
//! request, ahead of any transaction, span, error or metrics record.

use serde::Serialize;

/// The reporting process: just its id, in line with the original
/// agent's minimal process block (title/argv are an external
/// collaborator here).
#[derive(Debug, Clone, Serialize)]
pub struct Process {
    /// Operating-system process id.
    pub pid: u32,
}

/// The reporting service identity.
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    /// Reported service name.
    pub name: String,
    /// Reported service version, omitted when empty.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Reported deployment environment, omitted when empty.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub environment: String,
    /// Name of this agent, for the collector's own bookkeeping.
    pub agent: AgentInfo,
}

/// Identifies this library to the collector.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    /// Agent name.
    pub name: &'static str,
    /// Agent version, taken from this crate's own `Cargo.toml`.
    pub version: &'static str,
}

impl Default for AgentInfo {
    fn default() -> Self {
        AgentInfo {
            name: "elasticapm-core-rust",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// The full `metadata` record body.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    /// The reporting process.
    pub process: Process,
    /// The reporting service.
    pub service: Service,
}

impl Metadata {
    /// Builds the metadata record from the resolved service identity.
    #[must_use]
    pub fn new(service_name: &str, service_version: &str, environment: &str) -> Self {
        Metadata {
            process: Process { pid: std::process::id() },
            service: Service {
                name: service_name.to_string(),
                version: service_version.to_string(),
                environment: environment.to_string(),
                agent: AgentInfo::default(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serializes_service_name() {
        let metadata = Metadata::new("svc", "", "");
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"name\":\"svc\""));
        assert!(!json.contains("\"version\""));
    }
}
