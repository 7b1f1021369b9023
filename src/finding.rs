use serde::Serialize;

/// Ordinal severity of a finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Priority {
    Normal,
    Low,
}

/// Where a finding was observed.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub(crate) struct FindingLocation {
    pub(crate) class_name: String,
    pub(crate) method_name: String,
    pub(crate) method_descriptor: String,
    pub(crate) offset: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) artifact_uri: Option<String>,
}

/// Member a finding is about.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum Subject {
    Field {
        owner: String,
        name: String,
        descriptor: String,
    },
    Local {
        index: u16,
    },
}

/// One reported instance of an anti-pattern.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub(crate) struct Finding {
    pub(crate) rule_id: &'static str,
    pub(crate) priority: Priority,
    pub(crate) location: FindingLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) subject: Option<Subject>,
}

impl Finding {
    /// Deterministic ordering key: rule id, class, method, offset.
    pub(crate) fn sort_key(&self) -> (&str, &str, &str, &str, u32) {
        (
            self.rule_id,
            &self.location.class_name,
            &self.location.method_name,
            &self.location.method_descriptor,
            self.location.offset,
        )
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Field { owner, name, .. } => write!(f, "field {owner}.{name}"),
            Subject::Local { index } => write!(f, "local variable {index}"),
        }
    }
}

/// Internal analysis condition, reported apart from findings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct AnalysisDiagnostic {
    pub(crate) class_name: String,
    pub(crate) method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) detector: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) offset: Option<u32>,
    pub(crate) message: String,
}

/// Sort findings the way every report presents them.
pub(crate) fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|left, right| left.sort_key().cmp(&right.sort_key()));
}
