//! Prompt registry.
//!
//! Explicit, versioned mapping from operation kind to prompt template,
//! required fields, and output schema. Templates are validated at startup
//! (every required field must appear as a placeholder) and at render time
//! (no placeholder may remain unresolved), rather than resolved by ambient
//! lookup.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{EngineError, EngineResult};

fn placeholder_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Placeholders are bare snake_case words in braces; JSON braces in the
    // format instructions never match.
    RE.get_or_init(|| Regex::new(r"\{[a-z_][a-z0-9_]*\}").unwrap())
}

pub const REGISTRY_VERSION: &str = "2";

/// Operation kinds with a generation contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Summarize one cluster of act fragments or lower-level summaries.
    ClusterSummary,
    /// Summarize one internal document's fragments (or summary cluster).
    DocumentSummary,
    /// Score the impact of one change on one document.
    ImpactAssessment,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ClusterSummary => "cluster-summary",
            OperationKind::DocumentSummary => "document-summary",
            OperationKind::ImpactAssessment => "impact-assessment",
        }
    }
}

/// Output schema identifier; the generation client validates against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSchema {
    /// `{title, summary, relevant}`
    Summary,
    /// `{score, justification}`
    Impact,
}

/// One registered prompt contract.
#[derive(Debug, Clone)]
pub struct PromptSpec {
    pub kind: OperationKind,
    pub template: &'static str,
    pub required_fields: &'static [&'static str],
    pub output_schema: OutputSchema,
}

const SUMMARY_FORMAT_INSTRUCTIONS: &str = r#"Respond with a single JSON object and nothing else:
{"title": "<short title>", "summary": "<summary of at most 120 words>", "relevant": <true if the text is genuine legal or organizational content, false if it is noise, boilerplate, or out of scope>}"#;

const IMPACT_FORMAT_INSTRUCTIONS: &str = r#"Respond with a single JSON object and nothing else:
{"score": <number between 0.00 and 1.00>, "justification": "<at most 80 words>"}
Score semantics: 1.00 = an adjustment of the document is certainly required; 0.50 or higher = likely required; below 0.50 = unlikely; 0.00 = certainly not required or the provided information is insufficient to judge."#;

const CLUSTER_SUMMARY_TEMPLATE: &str = r#"You summarize legal provisions for a compliance monitoring system.

The text below is a group of related provisions from the act "{act_title}".
Hierarchy level: {cluster_level} (0 means raw article text; higher levels are
summaries of summaries — write more generally the higher the level, staying
concrete at level 0).

Text:
{text}

Produce a title and a summary of at most 120 words covering the obligations,
scopes, and deadlines the provisions establish. Flag whether the content is
genuine legal material.

{format_instructions}"#;

const DOCUMENT_SUMMARY_TEMPLATE: &str = r#"You summarize internal organizational documents (policies, templates,
contracts) for a compliance monitoring system.

The text below belongs to the document "{doc_title}".
Hierarchy level: {cluster_level} (0 means raw document text; higher levels are
summaries of summaries — write more generally the higher the level).

Text:
{text}

Produce a title and a summary of at most 120 words covering what the document
regulates and which legal provisions it relies on. Flag whether the content is
genuine organizational material.

{format_instructions}"#;

const IMPACT_ASSESSMENT_TEMPLATE: &str = r#"You assess whether a change in a legal act requires updating an internal
document.

Act: {act_title}
Act summary: {act_summary}
Change type: {change_type}
Provision before the change:
{changed_text}
Provision after the change:
{changing_text}

Document: {doc_title}
Document summary: {doc_summary}
Most relevant document passage:
{doc_text}

Judge how likely it is that this change requires adjusting the document.

{format_instructions}"#;

const SPECS: &[PromptSpec] = &[
    PromptSpec {
        kind: OperationKind::ClusterSummary,
        template: CLUSTER_SUMMARY_TEMPLATE,
        required_fields: &["act_title", "cluster_level", "text"],
        output_schema: OutputSchema::Summary,
    },
    PromptSpec {
        kind: OperationKind::DocumentSummary,
        template: DOCUMENT_SUMMARY_TEMPLATE,
        required_fields: &["doc_title", "cluster_level", "text"],
        output_schema: OutputSchema::Summary,
    },
    PromptSpec {
        kind: OperationKind::ImpactAssessment,
        template: IMPACT_ASSESSMENT_TEMPLATE,
        required_fields: &[
            "act_title",
            "act_summary",
            "change_type",
            "changed_text",
            "changing_text",
            "doc_title",
            "doc_summary",
            "doc_text",
        ],
        output_schema: OutputSchema::Impact,
    },
];

/// Startup-validated registry of prompt contracts.
pub struct PromptRegistry {
    specs: HashMap<OperationKind, &'static PromptSpec>,
}

impl PromptRegistry {
    /// Build and validate the registry. Fails if any template is missing a
    /// required field placeholder.
    pub fn load() -> EngineResult<Self> {
        let mut specs = HashMap::new();
        for spec in SPECS {
            for field in spec.required_fields {
                let placeholder = format!("{{{}}}", field);
                if !spec.template.contains(&placeholder) {
                    return Err(EngineError::MalformedResponse {
                        kind: "prompt-registry",
                        attempts: 0,
                        detail: format!(
                            "template '{}' is missing required placeholder {}",
                            spec.kind.as_str(),
                            placeholder
                        ),
                    });
                }
            }
            specs.insert(spec.kind, spec);
        }
        Ok(Self { specs })
    }

    pub fn spec(&self, kind: OperationKind) -> &PromptSpec {
        // Every variant is registered in SPECS; load() guarantees presence.
        self.specs[&kind]
    }

    /// Render a prompt, interpolating `fields` and the schema-appropriate
    /// format instructions. Fails if a required field is absent or the
    /// template carries a placeholder nothing resolves.
    pub fn render(
        &self,
        kind: OperationKind,
        fields: &HashMap<&str, String>,
    ) -> EngineResult<String> {
        let spec = self.spec(kind);

        for field in spec.required_fields {
            if !fields.contains_key(field) {
                return Err(EngineError::InsufficientData(format!(
                    "prompt '{}' requires field '{}'",
                    kind.as_str(),
                    field
                )));
            }
        }

        // Checked against the template, not the rendered text, so field
        // values containing literal braces cannot trip it.
        for placeholder in placeholder_pattern().find_iter(spec.template) {
            let name = placeholder
                .as_str()
                .trim_start_matches('{')
                .trim_end_matches('}');
            if name != "format_instructions" && !fields.contains_key(name) {
                return Err(EngineError::InsufficientData(format!(
                    "prompt '{}' has unresolved placeholder {}",
                    kind.as_str(),
                    placeholder.as_str()
                )));
            }
        }

        let mut rendered = spec.template.to_string();
        for (key, value) in fields {
            rendered = rendered.replace(&format!("{{{}}}", key), value);
        }

        let instructions = match spec.output_schema {
            OutputSchema::Summary => SUMMARY_FORMAT_INSTRUCTIONS,
            OutputSchema::Impact => IMPACT_FORMAT_INSTRUCTIONS,
        };
        rendered = rendered.replace("{format_instructions}", instructions);

        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_registry_loads_and_validates() {
        let registry = PromptRegistry::load().unwrap();
        assert_eq!(
            registry.spec(OperationKind::ImpactAssessment).output_schema,
            OutputSchema::Impact
        );
    }

    #[test]
    fn test_render_cluster_summary() {
        let registry = PromptRegistry::load().unwrap();
        let rendered = registry
            .render(
                OperationKind::ClusterSummary,
                &fields(&[
                    ("act_title", "Tax Act"),
                    ("cluster_level", "0"),
                    ("text", "Art. 1. Something."),
                ]),
            )
            .unwrap();
        assert!(rendered.contains("Tax Act"));
        assert!(rendered.contains("Art. 1. Something."));
        assert!(rendered.contains("single JSON object"));
        assert!(!rendered.contains("{text}"));
    }

    #[test]
    fn test_render_missing_field_fails() {
        let registry = PromptRegistry::load().unwrap();
        let err = registry
            .render(
                OperationKind::ClusterSummary,
                &fields(&[("act_title", "Tax Act"), ("cluster_level", "0")]),
            )
            .unwrap_err();
        assert!(err.to_string().contains("text"));
    }

    #[test]
    fn test_render_impact_carries_all_fields() {
        let registry = PromptRegistry::load().unwrap();
        let rendered = registry
            .render(
                OperationKind::ImpactAssessment,
                &fields(&[
                    ("act_title", "Tax Act"),
                    ("act_summary", "Taxes."),
                    ("change_type", "modified"),
                    ("changed_text", "old"),
                    ("changing_text", "new"),
                    ("doc_title", "VAT policy"),
                    ("doc_summary", "Handles VAT."),
                    ("doc_text", "passage"),
                ]),
            )
            .unwrap();
        for needle in ["Tax Act", "modified", "VAT policy", "passage"] {
            assert!(rendered.contains(needle), "missing {}", needle);
        }
    }
}
