use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde_json::json;
use serde_sarif::sarif::{
    ArtifactLocation, Invocation, Location, LogicalLocation, Message, MultiformatMessageString,
    Notification, PhysicalLocation, PropertyBag, Region, ReportingConfiguration,
    ReportingDescriptor, Result as SarifResult, ResultLevel, Run, SCHEMA_URL, Sarif, Tool, ToolComponent,
};

use crate::detectors::RuleMetadata;
use crate::engine::EngineOutput;
use crate::finding::{AnalysisDiagnostic, Finding, FindingLocation, Priority};

const TOOL_NAME: &str = "inspequte-idioms";

/// Report encodings selectable on the command line.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    /// SARIF 2.1.0 log.
    #[default]
    Sarif,
    /// Plain JSON array of findings.
    Json,
}

/// Metadata captured for SARIF invocation properties.
#[derive(Clone, Debug, Default)]
pub(crate) struct RunStats {
    pub(crate) scan_duration_ms: u128,
    pub(crate) analysis_duration_ms: u128,
    pub(crate) class_count: usize,
    pub(crate) skipped_entries: usize,
}

/// Serialize `output` in `format` to `writer`.
pub(crate) fn write_report(
    writer: &mut dyn Write,
    format: OutputFormat,
    rules: &[&RuleMetadata],
    output: &EngineOutput,
    stats: &RunStats,
) -> Result<()> {
    match format {
        OutputFormat::Sarif => {
            let invocation = build_invocation(stats, &output.diagnostics);
            let sarif = build_sarif(rules, &output.findings, invocation);
            serde_json::to_writer_pretty(&mut *writer, &sarif)
                .context("failed to serialize SARIF output")?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, &output.findings)
                .context("failed to serialize JSON output")?;
        }
    }
    writer.write_all(b"\n").context("failed to write report")?;
    Ok(())
}

fn build_invocation(stats: &RunStats, diagnostics: &[AnalysisDiagnostic]) -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");
    let mut properties = BTreeMap::new();
    properties.insert(
        "inspequte-idioms.scan_ms".to_string(),
        json!(stats.scan_duration_ms),
    );
    properties.insert(
        "inspequte-idioms.analysis_ms".to_string(),
        json!(stats.analysis_duration_ms),
    );
    properties.insert(
        "inspequte-idioms.class_count".to_string(),
        json!(stats.class_count),
    );
    properties.insert(
        "inspequte-idioms.skipped_entries".to_string(),
        json!(stats.skipped_entries),
    );
    let properties = PropertyBag::builder()
        .additional_properties(properties)
        .build();

    if diagnostics.is_empty() {
        Invocation::builder()
            .execution_successful(true)
            .arguments(arguments)
            .command_line(command_line)
            .properties(properties)
            .build()
    } else {
        Invocation::builder()
            .execution_successful(true)
            .arguments(arguments)
            .command_line(command_line)
            .properties(properties)
            .tool_execution_notifications(diagnostics.iter().map(notification).collect::<Vec<_>>())
            .build()
    }
}

fn notification(diagnostic: &AnalysisDiagnostic) -> Notification {
    let mut scope = diagnostic.class_name.clone();
    if let Some(method) = &diagnostic.method {
        scope.push('.');
        scope.push_str(method);
    }
    if let Some(offset) = diagnostic.offset {
        scope.push_str(&format!(" at offset {offset}"));
    }
    let text = match diagnostic.detector {
        Some(detector) => format!("{detector} disabled in {scope}: {}", diagnostic.message),
        None => format!("analysis abandoned in {scope}: {}", diagnostic.message),
    };
    Notification::builder()
        .message(Message::builder().text(text).build())
        .level(json!("warning"))
        .build()
}

fn build_sarif(rules: &[&RuleMetadata], findings: &[Finding], invocation: Invocation) -> Sarif {
    let mut sorted_rules = rules.to_vec();
    sorted_rules.sort_by_key(|rule| rule.id);
    let descriptors: BTreeMap<&str, &RuleMetadata> =
        sorted_rules.iter().map(|rule| (rule.id, *rule)).collect();
    let results = findings
        .iter()
        .map(|finding| sarif_result(finding, descriptors.get(finding.rule_id).copied()))
        .collect::<Vec<_>>();

    let driver = ToolComponent::builder()
        .name(TOOL_NAME)
        .version(env!("CARGO_PKG_VERSION"))
        .rules(sorted_rules.iter().map(|rule| rule_descriptor(rule)).collect::<Vec<_>>())
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = Run::builder()
        .tool(tool)
        .invocations(vec![invocation])
        .results(results)
        .build();

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}

fn rule_descriptor(rule: &RuleMetadata) -> ReportingDescriptor {
    ReportingDescriptor::builder()
        .id(rule.id)
        .name(rule.name)
        .short_description(
            MultiformatMessageString::builder()
                .text(rule.description)
                .build(),
        )
        .default_configuration(
            ReportingConfiguration::builder()
                .level(json!(level(rule.priority)))
                .build(),
        )
        .build()
}

fn sarif_result(finding: &Finding, rule: Option<&RuleMetadata>) -> SarifResult {
    let description = rule.map(|rule| rule.description).unwrap_or(finding.rule_id);
    let text = match &finding.subject {
        Some(subject) => format!("{description} ({subject})"),
        None => description.to_string(),
    };
    SarifResult::builder()
        .rule_id(finding.rule_id)
        .level(
            level(finding.priority)
                .parse::<ResultLevel>()
                .expect("level() returns a valid SARIF result level"),
        )
        .message(Message::builder().text(text).build())
        .locations(vec![finding_location(&finding.location)])
        .build()
}

fn level(priority: Priority) -> &'static str {
    match priority {
        Priority::Normal => "warning",
        Priority::Low => "note",
    }
}

fn finding_location(location: &FindingLocation) -> Location {
    let logical = LogicalLocation::builder()
        .name(format!(
            "{}.{}{}",
            location.class_name, location.method_name, location.method_descriptor
        ))
        .kind("function")
        .build();
    let Some(uri) = location.artifact_uri.as_deref() else {
        return Location::builder().logical_locations(vec![logical]).build();
    };
    // Lines inside a jar entry cannot be addressed on the container.
    let container_uri = jar_container_uri(uri);
    let artifact_location = ArtifactLocation::builder()
        .uri(container_uri.as_deref().unwrap_or(uri).to_string())
        .build();
    let physical = match (container_uri.is_none(), location.line) {
        (true, Some(line)) => PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .region(Region::builder().start_line(line as i64).build())
            .build(),
        _ => PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .build(),
    };
    Location::builder()
        .logical_locations(vec![logical])
        .physical_location(physical)
        .build()
}

fn jar_container_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("jar:")?;
    let container = rest.split("!/").next()?;
    Some(container.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::Subject;

    const RULE: RuleMetadata = RuleMetadata {
        id: "TST_RULE",
        name: "Test rule",
        description: "Test rule description",
        priority: Priority::Normal,
    };

    fn finding(artifact_uri: Option<&str>, line: Option<u32>) -> Finding {
        Finding {
            rule_id: RULE.id,
            priority: Priority::Low,
            location: FindingLocation {
                class_name: "com/example/ClassA".to_string(),
                method_name: "methodX".to_string(),
                method_descriptor: "()V".to_string(),
                offset: 4,
                line,
                artifact_uri: artifact_uri.map(str::to_string),
            },
            subject: Some(Subject::Local { index: 1 }),
        }
    }

    fn render(format: OutputFormat, output: &EngineOutput) -> serde_json::Value {
        let mut buffer = Vec::new();
        write_report(&mut buffer, format, &[&RULE], output, &RunStats::default())
            .expect("write report");
        serde_json::from_slice(&buffer).expect("parse report")
    }

    #[test]
    fn sarif_is_minimal_and_valid_shape() {
        let value = render(OutputFormat::Sarif, &EngineOutput::default());
        assert_eq!(value["version"], "2.1.0");
        assert_eq!(value["$schema"], SCHEMA_URL);
        let run = &value["runs"][0];
        assert_eq!(run["tool"]["driver"]["name"], TOOL_NAME);
        assert_eq!(run["tool"]["driver"]["rules"][0]["id"], "TST_RULE");
        assert_eq!(
            run["tool"]["driver"]["rules"][0]["defaultConfiguration"]["level"],
            "warning"
        );
        assert!(run["results"].as_array().expect("results array").is_empty());
        assert_eq!(run["invocations"][0]["executionSuccessful"], true);
        assert!(run["invocations"][0]["toolExecutionNotifications"].is_null());
    }

    #[test]
    fn sarif_result_carries_level_locations_and_subject() {
        let output = EngineOutput {
            findings: vec![finding(
                Some("file:///tmp/classes/com/example/ClassA.class"),
                Some(12),
            )],
            diagnostics: Vec::new(),
        };
        let value = render(OutputFormat::Sarif, &output);
        let result = &value["runs"][0]["results"][0];
        assert_eq!(result["ruleId"], "TST_RULE");
        assert_eq!(result["level"], "note");
        assert_eq!(
            result["message"]["text"],
            "Test rule description (local variable 1)"
        );
        let location = &result["locations"][0];
        assert_eq!(
            location["logicalLocations"][0]["name"],
            "com/example/ClassA.methodX()V"
        );
        assert_eq!(location["logicalLocations"][0]["kind"], "function");
        assert_eq!(
            location["physicalLocation"]["artifactLocation"]["uri"],
            "file:///tmp/classes/com/example/ClassA.class"
        );
        assert_eq!(location["physicalLocation"]["region"]["startLine"], 12);
    }

    #[test]
    fn jar_entries_point_at_the_container() {
        let output = EngineOutput {
            findings: vec![finding(
                Some("jar:file:///tmp/app.jar!/com/example/ClassA.class"),
                Some(12),
            )],
            diagnostics: Vec::new(),
        };
        let value = render(OutputFormat::Sarif, &output);
        let physical = &value["runs"][0]["results"][0]["locations"][0]["physicalLocation"];
        assert_eq!(physical["artifactLocation"]["uri"], "file:///tmp/app.jar");
        assert!(physical["region"].is_null());
    }

    #[test]
    fn diagnostics_become_notifications() {
        let output = EngineOutput {
            findings: Vec::new(),
            diagnostics: vec![AnalysisDiagnostic {
                class_name: "com/example/ClassA".to_string(),
                method: Some("methodX()V".to_string()),
                detector: Some("TST"),
                offset: Some(7),
                message: "boom".to_string(),
            }],
        };
        let value = render(OutputFormat::Sarif, &output);
        let notification = &value["runs"][0]["invocations"][0]["toolExecutionNotifications"][0];
        assert_eq!(notification["level"], "warning");
        assert_eq!(
            notification["message"]["text"],
            "TST disabled in com/example/ClassA.methodX()V at offset 7: boom"
        );
    }

    #[test]
    fn json_format_is_a_plain_array_of_findings() {
        let output = EngineOutput {
            findings: vec![finding(None, None)],
            diagnostics: Vec::new(),
        };
        let value = render(OutputFormat::Json, &output);
        let findings = value.as_array().expect("array");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0]["rule_id"], "TST_RULE");
        assert_eq!(findings[0]["priority"], "low");
        assert_eq!(findings[0]["location"]["offset"], 4);
    }

    #[test]
    fn jar_container_uri_extracts_container() {
        assert_eq!(
            jar_container_uri("jar:file:///tmp/app.jar!/com/example/ClassA.class"),
            Some("file:///tmp/app.jar".to_string())
        );
        assert_eq!(jar_container_uri("file:///tmp/ClassA.class"), None);
    }
}
