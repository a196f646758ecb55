//! Criteria extraction and demographic matching

use super::{eligibility_trials, find_entry, trial_block};
use crate::parsing::{extract_json, extract_validated};
use crate::pipelines::{profile_from, Demographics};
use crate::state_machine::keys;
use crate::state_machine::{SharedMemory, State, StateOutput, Transition};
use crate::tools::TrialRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// One inclusion or exclusion item
///
/// Known shapes: `{"type": "age", "operator": ">=", "value": 18}`,
/// `{"type": "age", "min_age": "18 Years"}`, `{"type": "sex", "value": "FEMALE"}`,
/// `{"type": "stage", "values": ["IIIB"]}`. Anything else is kept in `details`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl Criterion {
    fn is(&self, kind: &str) -> bool {
        self.kind.trim().eq_ignore_ascii_case(kind)
    }

    fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}

/// Structured criteria for one trial
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialCriteria {
    #[serde(default)]
    pub inclusion: Vec<Criterion>,
    #[serde(default)]
    pub exclusion: Vec<Criterion>,
}

/// Criteria built from a record's published eligibility fields (pure function)
pub fn criteria_from_record(trial: &TrialRecord) -> TrialCriteria {
    let mut inclusion = Vec::new();
    let eligibility = &trial.eligibility;

    if let Some(min_age) = eligibility.min_age.as_deref().and_then(parse_age_years) {
        inclusion.push(Criterion {
            kind: "age".to_string(),
            operator: Some(">=".to_string()),
            value: Some(json!(min_age)),
            ..Default::default()
        });
    }
    if let Some(max_age) = eligibility.max_age.as_deref().and_then(parse_age_years) {
        inclusion.push(Criterion {
            kind: "age".to_string(),
            operator: Some("<=".to_string()),
            value: Some(json!(max_age)),
            ..Default::default()
        });
    }
    if let Some(sex) = eligibility.sex.as_deref().filter(|s| !s.trim().is_empty()) {
        inclusion.push(Criterion {
            kind: "sex".to_string(),
            value: Some(json!(sex.trim().to_uppercase())),
            ..Default::default()
        });
    }
    if !trial.criteria_snippet.trim().is_empty() {
        let mut details = Map::new();
        details.insert("text".to_string(), json!(trial.criteria_snippet.trim()));
        details.insert("parsed".to_string(), json!(false));
        inclusion.push(Criterion {
            kind: "text".to_string(),
            details,
            ..Default::default()
        });
    }

    TrialCriteria {
        inclusion,
        exclusion: Vec::new(),
    }
}

/// Years from registry-style ages: "18 Years", "6 Months", "65" (pure function)
pub fn parse_age_years(text: &str) -> Option<f64> {
    let text = text.trim().to_lowercase();
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let number: f64 = digits.parse().ok()?;

    let years = if text.contains("month") {
        number / 12.0
    } else if text.contains("week") {
        number / 52.0
    } else if text.contains("day") {
        number / 365.0
    } else {
        number
    };
    Some(years)
}

fn years_in(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_age_years(s),
        _ => None,
    }
}

/// Age or sex eligibility for one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicMatch {
    pub age_eligible: bool,
    pub age_reasoning: String,
    pub sex_eligible: bool,
    pub sex_reasoning: String,
    pub demographic_pass: bool,
}

/// Model form of [`DemographicMatch`]; absent fields are filled by the rules
#[derive(Debug, Clone, Default, Deserialize)]
struct ModelDemographicMatch {
    #[serde(default)]
    age_eligible: Option<bool>,
    #[serde(default)]
    age_reasoning: Option<String>,
    #[serde(default)]
    sex_eligible: Option<bool>,
    #[serde(default)]
    sex_reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AgeOp {
    AtLeast,
    Above,
    AtMost,
    Below,
    Exactly,
}

impl AgeOp {
    fn parse(op: &str) -> Option<Self> {
        match op.trim() {
            ">=" | "≥" => Some(Self::AtLeast),
            ">" => Some(Self::Above),
            "<=" | "≤" => Some(Self::AtMost),
            "<" => Some(Self::Below),
            "==" | "=" => Some(Self::Exactly),
            _ => None,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::AtLeast => ">=",
            Self::Above => ">",
            Self::AtMost => "<=",
            Self::Below => "<",
            Self::Exactly => "==",
        }
    }

    fn admits(self, age: f64, bound: f64) -> bool {
        match self {
            Self::AtLeast => age >= bound,
            Self::Above => age > bound,
            Self::AtMost => age <= bound,
            Self::Below => age < bound,
            Self::Exactly => (age - bound).abs() < f64::EPSILON,
        }
    }
}

fn age_bounds(criteria: &TrialCriteria) -> Vec<(AgeOp, f64)> {
    let mut bounds = Vec::new();
    for criterion in criteria.inclusion.iter().filter(|c| c.is("age")) {
        if let (Some(op), Some(years)) = (
            criterion.operator.as_deref().and_then(AgeOp::parse),
            criterion.value.as_ref().and_then(years_in),
        ) {
            bounds.push((op, years));
        }
        if let Some(years) = criterion.detail_str("min_age").and_then(parse_age_years) {
            bounds.push((AgeOp::AtLeast, years));
        }
        if let Some(years) = criterion.detail_str("max_age").and_then(parse_age_years) {
            bounds.push((AgeOp::AtMost, years));
        }
    }
    bounds
}

fn allowed_sex(criteria: &TrialCriteria) -> Option<String> {
    criteria
        .inclusion
        .iter()
        .filter(|c| c.is("sex") || c.is("gender"))
        .find_map(|c| c.value.as_ref().and_then(Value::as_str))
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty() && s != "ALL" && s != "BOTH")
}

fn patient_sex(demographics: &Demographics) -> Option<&'static str> {
    let sex = demographics.sex.as_deref()?.trim().to_lowercase();
    if sex.contains("female") || sex.contains("woman") || sex == "f" {
        Some("FEMALE")
    } else if sex.contains("male") || sex.contains("man") || sex == "m" {
        Some("MALE")
    } else {
        None
    }
}

/// Deterministic age and sex match against parsed criteria (pure function)
pub fn match_demographics_by_rules(
    demographics: &Demographics,
    criteria: &TrialCriteria,
) -> DemographicMatch {
    let bounds = age_bounds(criteria);
    let (age_eligible, age_reasoning) = match (demographics.age, bounds.is_empty()) {
        (_, true) => (true, "No age restriction stated".to_string()),
        (None, false) => (true, "Patient age not determinable".to_string()),
        (Some(age), false) => {
            let age = f64::from(age);
            let failed: Vec<String> = bounds
                .iter()
                .filter(|(op, bound)| !op.admits(age, *bound))
                .map(|(op, bound)| format!("{} {bound}", op.symbol()))
                .collect();
            let required: Vec<String> = bounds
                .iter()
                .map(|(op, bound)| format!("{} {bound}", op.symbol()))
                .collect();
            if failed.is_empty() {
                (true, format!("Patient is {age}, trial requires {}", required.join(" and ")))
            } else {
                (false, format!("Patient is {age}, trial requires {}", failed.join(" and ")))
            }
        }
    };

    let (sex_eligible, sex_reasoning) = match (allowed_sex(criteria), patient_sex(demographics)) {
        (None, _) => (true, "Trial allows all sexes".to_string()),
        (Some(_), None) => (true, "Patient sex not determinable".to_string()),
        (Some(allowed), Some(patient)) => (
            allowed == patient,
            format!("Patient is {}, trial enrolls {}", patient.to_lowercase(), allowed.to_lowercase()),
        ),
    };

    DemographicMatch {
        age_eligible,
        age_reasoning,
        sex_eligible,
        sex_reasoning,
        demographic_pass: age_eligible && sex_eligible,
    }
}

/// Criteria per trial identifier, as written by `extract_criteria`
pub(crate) fn criteria_from(memory: &SharedMemory) -> BTreeMap<String, TrialCriteria> {
    memory.get_as(keys::TRIAL_CRITERIA).unwrap_or_default()
}

/// Demographic matches per trial identifier
pub(crate) fn demographic_matches_from(memory: &SharedMemory) -> BTreeMap<String, DemographicMatch> {
    memory.get_as(keys::DEMOGRAPHIC_MATCHES).unwrap_or_default()
}

/// Require at least one entry keyed by a known trial
fn keyed_by_known_trial<T>(trials: &[TrialRecord]) -> impl Fn(&BTreeMap<String, T>) -> Result<(), String> + '_ {
    move |entries| {
        if entries
            .keys()
            .any(|id| trials.iter().any(|t| t.nct_id.eq_ignore_ascii_case(id.trim())))
        {
            Ok(())
        } else {
            Err("no entry keyed by a known trial identifier".to_string())
        }
    }
}

pub(crate) struct ExtractCriteriaState;

#[async_trait]
impl State for ExtractCriteriaState {
    fn name(&self) -> &str {
        "extract_criteria"
    }

    fn description(&self) -> &str {
        "Parse inclusion/exclusion criteria into structured format"
    }

    fn requires_completion(&self, memory: &SharedMemory) -> bool {
        !eligibility_trials(memory).is_empty()
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        "You are a clinical trial eligibility expert. Parse trial criteria into structured format.\n\n\
         For each trial, extract:\n\
         - Inclusion criteria (age, sex, stage, biomarkers, histology, performance status)\n\
         - Exclusion criteria (prior treatments, comorbidities, organ dysfunction)\n\n\
         Return a JSON object keyed by the exact NCT ID:\n\
         {\"NCT_ID\": {\"inclusion\": [{\"type\": \"age\", \"operator\": \">=\", \"value\": 18}, \
         {\"type\": \"stage\", \"values\": [\"IIIB\", \"IVA\"]}, \
         {\"type\": \"biomarker\", \"name\": \"PD-L1\", \"threshold\": 1, \"unit\": \"%\"}], \
         \"exclusion\": [{\"type\": \"prior_treatment\", \"agent\": \"pembrolizumab\"}]}}"
            .to_string()
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let mut text = String::from("Extract structured criteria from:\n\n");
        for (i, trial) in eligibility_trials(memory).iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, trial_block(trial)));
        }
        text
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let trials = eligibility_trials(memory);
        let mut output = StateOutput::new();

        let parsed: BTreeMap<String, TrialCriteria> = if trials.is_empty() {
            BTreeMap::new()
        } else {
            match extract_validated(raw, keyed_by_known_trial(&trials)) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    warn!(reason = %reason, "Criteria parsing failed, using registry eligibility fields");
                    output = output.degraded(format!("criteria built from trial records: {reason}"));
                    BTreeMap::new()
                }
            }
        };

        let mut from_model = 0;
        let criteria: BTreeMap<String, TrialCriteria> = trials
            .iter()
            .map(|trial| {
                let entry = match find_entry(&parsed, &trial.nct_id) {
                    Some(entry) => {
                        from_model += 1;
                        entry.clone()
                    }
                    None => criteria_from_record(trial),
                };
                (trial.nct_id.clone(), entry)
            })
            .collect();

        info!(trials = criteria.len(), from_model, "Trial criteria extracted");
        Transition::Advance(output.with_serialized(keys::TRIAL_CRITERIA, &criteria))
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("match_demographics".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::TRIAL_CRITERIA]
    }
}

pub(crate) struct MatchDemographicsState;

#[async_trait]
impl State for MatchDemographicsState {
    fn name(&self) -> &str {
        "match_demographics"
    }

    fn description(&self) -> &str {
        "Match age and sex criteria"
    }

    fn requires_completion(&self, memory: &SharedMemory) -> bool {
        !criteria_from(memory).is_empty()
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        "You are performing deterministic demographic matching.\n\n\
         For each trial, check:\n\
         1. Age eligibility (patient age vs trial requirements)\n\
         2. Sex eligibility (if the trial has sex restrictions)\n\n\
         Return a JSON object keyed by the exact NCT ID:\n\
         {\"NCT_ID\": {\"age_eligible\": true, \"age_reasoning\": \"Patient is 40, trial requires >=18\", \
         \"sex_eligible\": true, \"sex_reasoning\": \"Trial allows all sexes\"}}"
            .to_string()
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let demographics = profile_from(memory).demographics;
        let age = demographics
            .age
            .map(|a| a.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let sex = demographics.sex.unwrap_or_else(|| "Unknown".to_string());
        let criteria = serde_json::to_string_pretty(&criteria_from(memory)).unwrap_or_default();
        format!("Patient Age: {age}\nPatient Sex: {sex}\n\nTRIAL CRITERIA:\n{criteria}")
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let demographics = profile_from(memory).demographics;
        let criteria = criteria_from(memory);
        let mut output = StateOutput::new();

        let parsed: BTreeMap<String, ModelDemographicMatch> = if criteria.is_empty() {
            BTreeMap::new()
        } else {
            match extract_json(raw) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    warn!(reason = %reason, "Demographic match parsing failed, using rules");
                    output = output.degraded(format!("demographics matched by rules: {reason}"));
                    BTreeMap::new()
                }
            }
        };

        let matches: BTreeMap<String, DemographicMatch> = criteria
            .iter()
            .map(|(nct_id, trial_criteria)| {
                let mut result = match_demographics_by_rules(&demographics, trial_criteria);
                if let Some(model) = find_entry(&parsed, nct_id) {
                    if let Some(eligible) = model.age_eligible {
                        result.age_eligible = eligible;
                        result.age_reasoning = model
                            .age_reasoning
                            .clone()
                            .unwrap_or_else(|| "Assessed by model".to_string());
                    }
                    if let Some(eligible) = model.sex_eligible {
                        result.sex_eligible = eligible;
                        result.sex_reasoning = model
                            .sex_reasoning
                            .clone()
                            .unwrap_or_else(|| "Assessed by model".to_string());
                    }
                    result.demographic_pass = result.age_eligible && result.sex_eligible;
                }
                (nct_id.clone(), result)
            })
            .collect();

        let passing = matches.values().filter(|m| m.demographic_pass).count();
        info!(trials = matches.len(), passing, "Demographics matched");
        Transition::Advance(output.with_serialized(keys::DEMOGRAPHIC_MATCHES, &matches))
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("match_clinical_features".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::DEMOGRAPHIC_MATCHES]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_profile, sample_trial};

    fn age_criterion(op: &str, value: Value) -> Criterion {
        Criterion {
            kind: "age".to_string(),
            operator: Some(op.to_string()),
            value: Some(value),
            ..Default::default()
        }
    }

    fn criteria(inclusion: Vec<Criterion>) -> TrialCriteria {
        TrialCriteria {
            inclusion,
            exclusion: vec![],
        }
    }

    #[test]
    fn test_parse_age_years() {
        assert_eq!(parse_age_years("18 Years"), Some(18.0));
        assert_eq!(parse_age_years("6 Months"), Some(0.5));
        assert_eq!(parse_age_years("65"), Some(65.0));
        assert_eq!(parse_age_years("N/A"), None);
    }

    #[test]
    fn test_record_criteria_carry_published_fields() {
        let criteria = criteria_from_record(&sample_trial("NCT1", "Trial"));
        let kinds: Vec<&str> = criteria.inclusion.iter().map(|c| c.kind.as_str()).collect();
        assert_eq!(kinds, vec!["age", "sex", "text"]);
        assert_eq!(criteria.inclusion[0].value, Some(json!(18.0)));
        assert_eq!(criteria.inclusion[2].details["parsed"], json!(false));
    }

    #[test]
    fn test_age_operators() {
        let demographics = sample_profile().demographics;
        let cases = [
            (">=", 45, true),
            (">", 45, false),
            ("<=", 45, true),
            ("<", 45, false),
            ("==", 45, true),
            (">=", 50, false),
        ];
        for (op, bound, expected) in cases {
            let result = match_demographics_by_rules(
                &demographics,
                &criteria(vec![age_criterion(op, json!(bound))]),
            );
            assert_eq!(result.age_eligible, expected, "{op} {bound}");
        }
    }

    #[test]
    fn test_min_max_age_details() {
        let mut criterion = Criterion {
            kind: "Age".to_string(),
            ..Default::default()
        };
        criterion.details.insert("min_age".to_string(), json!("18 Years"));
        criterion.details.insert("max_age".to_string(), json!("40 Years"));

        let result =
            match_demographics_by_rules(&sample_profile().demographics, &criteria(vec![criterion]));
        assert!(!result.age_eligible);
        assert!(!result.demographic_pass);
        assert!(result.age_reasoning.contains("<= 40"));
    }

    #[test]
    fn test_sex_restrictions() {
        let male_only = criteria(vec![Criterion {
            kind: "sex".to_string(),
            value: Some(json!("MALE")),
            ..Default::default()
        }]);
        let female = sample_profile().demographics;
        assert!(!match_demographics_by_rules(&female, &male_only).sex_eligible);

        let all = criteria(vec![Criterion {
            kind: "sex".to_string(),
            value: Some(json!("ALL")),
            ..Default::default()
        }]);
        assert!(match_demographics_by_rules(&female, &all).sex_eligible);
    }

    #[test]
    fn test_unknown_patient_values_pass() {
        let unknown = Demographics::default();
        let restricted = criteria(vec![
            age_criterion(">=", json!(18)),
            Criterion {
                kind: "sex".to_string(),
                value: Some(json!("FEMALE")),
                ..Default::default()
            },
        ]);
        let result = match_demographics_by_rules(&unknown, &restricted);
        assert!(result.demographic_pass);
        assert_eq!(result.age_reasoning, "Patient age not determinable");
        assert_eq!(result.sex_reasoning, "Patient sex not determinable");
    }
}
