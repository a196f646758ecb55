//! Patient Profile pipeline
//!
//! extract_demographics → extract_diagnoses → extract_biomarkers →
//! extract_treatment_history → generate_search_terms, all reading the
//! report text seeded under `report_text`.

use crate::parsing::{extract_json, Extraction};
use crate::pipelines::cancer_type_queries;
use crate::state_machine::keys::{self, PATIENT_PROFILER};
use crate::state_machine::{SharedMemory, State, StateMachine, StateOutput, Transition};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

static AGE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r#"\bage\b[:\s"]*(\d{1,3})"#, r"(\d{1,3})[- ]year", r"(\d{1,3})\s*(?:yo|y/o)\b"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

static ECOG_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\becog[:\s]*(\d)").ok());

const DISEASE_WORDS: &[&str] = &[
    "cancer",
    "carcinoma",
    "tumor",
    "tumour",
    "neoplasm",
    "lymphoma",
    "leukemia",
    "sarcoma",
    "melanoma",
    "malignan",
];

const PREAMBLE_PREFIXES: &[&str] = &["here are", "based on", "search terms", "example", "note"];

/// Basic demographics extracted from a report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecog: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pregnancy_status: Option<String>,
}

impl Demographics {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Structured patient profile passed between pipelines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientProfile {
    #[serde(default)]
    pub demographics: Demographics,
    #[serde(default)]
    pub diagnoses: String,
    #[serde(default)]
    pub biomarkers: String,
    #[serde(default)]
    pub treatment_history: String,
    #[serde(default)]
    pub search_terms: Vec<String>,
}

impl PatientProfile {
    /// Assemble from a completed profiler machine's memory
    pub fn from_memory(memory: &SharedMemory) -> Self {
        Self {
            demographics: memory.get_as(keys::DEMOGRAPHICS).unwrap_or_default(),
            diagnoses: memory.get_str(keys::DIAGNOSES).to_string(),
            biomarkers: memory.get_str(keys::BIOMARKERS).to_string(),
            treatment_history: memory.get_str(keys::TREATMENT_HISTORY).to_string(),
            search_terms: memory.get_as(keys::SEARCH_TERMS).unwrap_or_default(),
        }
    }
}

/// Normalize free-text sex to "Female"/"Male" (pure function)
fn normalize_sex(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    if lower.contains("female") || lower.contains("woman") {
        Some("Female".to_string())
    } else if lower.contains("male") || lower.contains(" man") || lower == "m" {
        Some("Male".to_string())
    } else if lower == "f" {
        Some("Female".to_string())
    } else {
        None
    }
}

fn number_in(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .and_then(|part| part.parse().ok()),
        Value::Object(map) => map
            .iter()
            .find(|(k, _)| k.to_lowercase().contains("ecog"))
            .and_then(|(_, v)| number_in(v)),
        _ => None,
    }
}

/// Demographics from a parsed JSON object with loosely named keys (pure function)
fn demographics_from_object(data: &Map<String, Value>) -> Demographics {
    let lookup = |candidates: &[&str]| {
        data.iter()
            .find(|(k, v)| {
                let key = k.to_lowercase().replace([' ', '/'], "_");
                candidates.contains(&key.as_str()) && !v.is_null()
            })
            .map(|(_, v)| v)
    };

    let pregnancy_status = data
        .iter()
        .find(|(k, _)| k.to_lowercase().contains("pregnan"))
        .and_then(|(_, v)| {
            let text = match v {
                Value::String(s) => s.to_lowercase(),
                other => other.to_string().to_lowercase(),
            };
            if text.contains("not") || text.contains("n/a") || text.contains("applicable") || text == "false" || text == "no" {
                Some("Not applicable".to_string())
            } else if text.contains("yes") || text.contains("positive") || text == "true" {
                Some("Pregnant".to_string())
            } else {
                None
            }
        });

    Demographics {
        age: lookup(&["age", "patient_age"]).and_then(number_in),
        sex: lookup(&["sex", "gender", "gender_sex"])
            .and_then(Value::as_str)
            .and_then(normalize_sex),
        ecog: lookup(&["ecog", "performance_status", "ecog_performance_status"]).and_then(number_in),
        pregnancy_status,
    }
}

/// Demographics from prose via regular expressions (pure function)
fn demographics_from_prose(text: &str) -> Demographics {
    let lower = text.to_lowercase();
    let age = AGE_PATTERNS
        .iter()
        .find_map(|re| re.captures(&lower))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok());

    let sex = if lower.contains("female") || lower.contains("woman") {
        Some("Female".to_string())
    } else if lower.contains("male") || lower.contains(" man ") {
        Some("Male".to_string())
    } else {
        None
    };

    let ecog = ECOG_PATTERN
        .as_ref()
        .and_then(|re| re.captures(&lower))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok());

    Demographics {
        age,
        sex,
        ecog,
        pregnancy_status: None,
    }
}

/// Search terms from line-oriented model output (pure function)
fn parse_search_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for line in text.lines() {
        let cleaned = line
            .trim()
            .trim_start_matches(|c: char| c == '-' || c == '*' || c == '•' || c.is_ascii_digit() || c == '.' || c == ')' || c.is_whitespace())
            .trim_matches('"')
            .trim();
        let lower = cleaned.to_lowercase();

        if cleaned.is_empty() || PREAMBLE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            continue;
        }
        if !DISEASE_WORDS.iter().any(|w| lower.contains(w)) {
            continue;
        }
        if !terms.iter().any(|t| t.eq_ignore_ascii_case(cleaned)) {
            terms.push(cleaned.to_string());
        }
    }
    terms
}

/// Report text given to every extraction prompt
fn report_task(memory: &SharedMemory) -> String {
    format!("MEDICAL REPORT:\n{}", memory.get_str(keys::REPORT_TEXT))
}

struct ExtractDemographicsState;

#[async_trait]
impl State for ExtractDemographicsState {
    fn name(&self) -> &str {
        "extract_demographics"
    }

    fn description(&self) -> &str {
        "Extract patient age, sex, and performance status"
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        "From the medical report, extract:\n\
         - Patient age (or age range if exact not available)\n\
         - Sex\n\
         - Pregnancy status if mentioned\n\
         - Performance status (ECOG) if mentioned\n\n\
         Return a JSON object: {\"age\": 45, \"sex\": \"Female\", \"ecog\": 1, \"pregnancy_status\": \"Not applicable\"}.\n\
         Use null for anything not stated."
            .to_string()
    }

    fn task(&self, memory: &SharedMemory) -> String {
        report_task(memory)
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let extraction = match extract_json::<Map<String, Value>>(raw) {
            Ok(object) => Extraction::Parsed(demographics_from_object(&object)),
            Err(reason) => {
                let mut value = demographics_from_prose(raw);
                if value.is_empty() {
                    value = demographics_from_prose(memory.get_str(keys::REPORT_TEXT));
                }
                Extraction::Degraded { value, reason }
            }
        };

        let mut output = StateOutput::new();
        if let Some(reason) = extraction.reason() {
            warn!(reason, "Demographics JSON unavailable, using text patterns");
            output = output.degraded(format!("demographics parsed from prose: {reason}"));
        }
        let demographics = extraction.into_value();
        info!(age = ?demographics.age, sex = ?demographics.sex, "Demographics extracted");

        Transition::Advance(output.with_serialized(keys::DEMOGRAPHICS, &demographics))
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("extract_diagnoses".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::DEMOGRAPHICS]
    }
}

/// States that keep the model's text verbatim under one key
struct ExtractTextState {
    name: &'static str,
    description: &'static str,
    instruction: &'static str,
    key: &'static str,
    writes: &'static [&'static str],
    next: Option<&'static str>,
}

#[async_trait]
impl State for ExtractTextState {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        self.instruction.to_string()
    }

    fn task(&self, memory: &SharedMemory) -> String {
        report_task(memory)
    }

    async fn process(&self, raw: &str, _memory: &SharedMemory) -> Transition {
        let text = raw.trim();
        let mut output = StateOutput::new().with(self.key, json!(text));
        if text.is_empty() {
            warn!(key = self.key, "Empty extraction text");
            output = output.degraded("empty completion text");
        }
        info!(key = self.key, chars = text.len(), "Profile section extracted");
        Transition::Advance(output)
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        self.next.map(str::to_string)
    }

    fn writes(&self) -> &'static [&'static str] {
        self.writes
    }
}

struct GenerateSearchTermsState;

#[async_trait]
impl State for GenerateSearchTermsState {
    fn name(&self) -> &str {
        "generate_search_terms"
    }

    fn description(&self) -> &str {
        "Generate search strategy for trial matching"
    }

    fn instruction(&self, memory: &SharedMemory) -> String {
        format!(
            "Based on the patient's medical profile, generate clinical trial search terms.\n\n\
             Diagnoses: {}\n\
             Biomarkers: {}\n\n\
             Generate 5-8 search terms ordered from most specific to broad: exact diagnosis \
             with biomarkers first, then disease-specific terms, then broader disease categories.\n\n\
             FORMAT: one term per line, no bullets or numbers.\n\
             Example:\n\
             cervical squamous cell carcinoma PIK3CA\n\
             stage III cervical cancer\n\
             cervical carcinoma\n\
             gynecologic cancer",
            memory.get_str(keys::DIAGNOSES),
            memory.get_str(keys::BIOMARKERS)
        )
    }

    fn task(&self, _memory: &SharedMemory) -> String {
        "Generate the search terms for this patient.".to_string()
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let terms = parse_search_terms(raw);
        let mut output = StateOutput::new();

        let terms = if terms.is_empty() {
            let fallback = cancer_type_queries(memory.get_str(keys::DIAGNOSES))
                .unwrap_or_else(|| vec!["cancer".to_string()]);
            warn!(fallback = ?fallback, "No usable search terms, deriving from diagnosis");
            output = output.degraded("no search terms found in completion text");
            fallback
        } else {
            terms
        };

        info!(count = terms.len(), "Search terms generated");
        Transition::Advance(
            output
                .with_serialized(keys::SEARCH_TERMS, &terms)
                .with(keys::PROFILE_COMPLETE, json!(true)),
        )
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        None
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::SEARCH_TERMS, keys::PROFILE_COMPLETE]
    }
}

/// Fresh patient profiler machine seeded with the report text
pub fn build_patient_profile_machine(report_text: &str) -> StateMachine {
    let mut machine = StateMachine::new(PATIENT_PROFILER)
        .with_state(Box::new(ExtractDemographicsState), true)
        .with_state(
            Box::new(ExtractTextState {
                name: "extract_diagnoses",
                description: "Extract all diagnoses and conditions",
                instruction: "From the medical report, extract:\n\
                    - Primary diagnosis\n\
                    - Cancer stage/grade (TNM, AJCC, FIGO)\n\
                    - Secondary diagnoses or comorbidities\n\
                    - Disease status (newly diagnosed, recurrent, progressive, stable)\n\
                    Be specific about histology and molecular subtype.",
                key: keys::DIAGNOSES,
                writes: &[keys::DIAGNOSES],
                next: Some("extract_biomarkers"),
            }),
            false,
        )
        .with_state(
            Box::new(ExtractTextState {
                name: "extract_biomarkers",
                description: "Extract molecular markers and test results",
                instruction: "From the medical report, extract:\n\
                    - Genetic mutations (e.g., EGFR, KRAS, BRAF, PIK3CA)\n\
                    - Protein expression (e.g., PD-L1, ER, PR, HER2)\n\
                    - Microsatellite status and tumor mutational burden\n\
                    - Viral status (e.g., HPV) and other molecular results\n\
                    Include test values and interpretation if available.",
                key: keys::BIOMARKERS,
                writes: &[keys::BIOMARKERS],
                next: Some("extract_treatment_history"),
            }),
            false,
        )
        .with_state(
            Box::new(ExtractTextState {
                name: "extract_treatment_history",
                description: "Extract treatment history",
                instruction: "From the medical report, extract:\n\
                    - Current treatments\n\
                    - Prior treatments with dates if available\n\
                    - Response to previous treatments\n\
                    - Contraindicated medications or allergies\n\
                    - Recent surgeries or procedures",
                key: keys::TREATMENT_HISTORY,
                writes: &[keys::TREATMENT_HISTORY],
                next: Some("generate_search_terms"),
            }),
            false,
        )
        .with_state(Box::new(GenerateSearchTermsState), false);

    machine
        .memory_mut()
        .insert(keys::REPORT_TEXT, json!(report_text));
    machine
}
