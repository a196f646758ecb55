//! Clinical feature matching: stage, histology, biomarkers
//!
//! Grades come from the model when it returns them and from text rules
//! otherwise. The clinical score is always recomputed here from the grades,
//! never taken from the model.

use super::criteria::demographic_matches_from;
use super::{eligibility_trials, find_entry, trial_block};
use crate::parsing::{extract_json, truncate_chars};
use crate::pipelines::{profile_from, PatientProfile};
use crate::state_machine::keys;
use crate::state_machine::{SharedMemory, State, StateOutput, Transition};
use crate::tools::TrialRecord;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const STAGE_WEIGHT: f64 = 0.3;
pub const HISTOLOGY_WEIGHT: f64 = 0.3;
pub const BIOMARKER_WEIGHT: f64 = 0.4;

static STAGE_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\bstage\s+(0|IV|III|II|I)([ABC]\d?)?\b").ok());

const HISTOLOGY_TERMS: &[&str] = &[
    "adenosquamous",
    "squamous",
    "adenocarcinoma",
    "non-small cell",
    "small cell",
    "neuroendocrine",
    "clear cell",
    "serous",
    "mucinous",
    "endometrioid",
    "ductal",
    "lobular",
    "urothelial",
    "melanoma",
    "sarcoma",
];

/// Marker name and the lowercase spellings that identify it
const BIOMARKERS: &[(&str, &[&str])] = &[
    ("PD-L1", &["pd-l1", "pdl1", "pd l1"]),
    ("HPV", &["hpv"]),
    ("HER2", &["her2", "her-2", "erbb2"]),
    ("EGFR", &["egfr"]),
    ("ALK", &["alk "]),
    ("KRAS", &["kras"]),
    ("BRAF", &["braf"]),
    ("BRCA", &["brca"]),
    ("MSI", &["msi-h", "msi high", "microsatellite"]),
    ("ROS1", &["ros1"]),
    ("NTRK", &["ntrk"]),
    ("PIK3CA", &["pik3ca"]),
    ("TMB", &["tmb", "tumor mutational burden"]),
];

/// Stage or histology match grade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchGrade {
    Exact,
    FuzzyHigh,
    FuzzyMedium,
    FuzzyLow,
    Mismatch,
    #[default]
    #[serde(other)]
    Unknown,
}

impl MatchGrade {
    pub fn score(self) -> f64 {
        match self {
            Self::Exact => 1.0,
            Self::FuzzyHigh => 0.9,
            Self::FuzzyMedium => 0.75,
            Self::FuzzyLow => 0.55,
            Self::Mismatch => 0.0,
            Self::Unknown => 0.5,
        }
    }
}

/// Per-biomarker match status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiomarkerStatus {
    Match,
    Partial,
    Mismatch,
    #[default]
    #[serde(other)]
    Unknown,
}

impl BiomarkerStatus {
    pub fn score(self) -> f64 {
        match self {
            Self::Match => 1.0,
            Self::Partial => 0.5,
            Self::Mismatch => 0.0,
            Self::Unknown => 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiomarkerMatch {
    #[serde(default)]
    pub status: BiomarkerStatus,
    #[serde(default)]
    pub reasoning: String,
}

/// Clinical grades and weighted score for one trial
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalMatch {
    #[serde(default)]
    pub stage_match: MatchGrade,
    #[serde(default)]
    pub stage_reasoning: String,
    #[serde(default)]
    pub histology_match: MatchGrade,
    #[serde(default)]
    pub histology_reasoning: String,
    #[serde(default)]
    pub biomarker_matches: BTreeMap<String, BiomarkerMatch>,
    #[serde(default)]
    pub clinical_score: f64,
}

impl ClinicalMatch {
    /// Weighted score from the grades; no biomarkers counts as unknown
    pub fn weighted_score(&self) -> f64 {
        let biomarker_score = if self.biomarker_matches.is_empty() {
            BiomarkerStatus::Unknown.score()
        } else {
            self.biomarker_matches
                .values()
                .map(|m| m.status.score())
                .sum::<f64>()
                / self.biomarker_matches.len() as f64
        };
        let score = STAGE_WEIGHT * self.stage_match.score()
            + HISTOLOGY_WEIGHT * self.histology_match.score()
            + BIOMARKER_WEIGHT * biomarker_score;
        (score * 10_000.0).round() / 10_000.0
    }

    fn rescored(mut self) -> Self {
        self.clinical_score = self.weighted_score();
        self
    }
}

fn trial_text(trial: &TrialRecord) -> String {
    format!(
        "{} {} {} {}",
        trial.title,
        trial.brief_summary,
        trial.criteria_snippet,
        trial.conditions.join(" ")
    )
    .to_lowercase()
}

fn roman_rank(roman: &str) -> u8 {
    match roman.to_uppercase().as_str() {
        "I" => 1,
        "II" => 2,
        "III" => 3,
        "IV" => 4,
        _ => 0,
    }
}

/// Patient stage as (roman numeral, full token), e.g. ("III", "IIIB")
fn patient_stage(diagnoses: &str) -> Option<(String, String)> {
    let caps = STAGE_PATTERN.as_ref()?.captures(diagnoses)?;
    let roman = caps.get(1)?.as_str().to_uppercase();
    let suffix = caps.get(2).map(|m| m.as_str().to_uppercase()).unwrap_or_default();
    Some((roman.clone(), format!("{roman}{suffix}")))
}

fn grade_stage(diagnoses: &str, text: &str) -> (MatchGrade, String) {
    let Some((roman, full)) = patient_stage(diagnoses) else {
        return (MatchGrade::Unknown, "Patient stage not stated".to_string());
    };
    let mentions = |token: &str| {
        let token = token.to_lowercase();
        text.match_indices(&format!("stage {token}")).any(|(i, m)| {
            text[i + m.len()..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_ascii_alphanumeric())
        })
    };
    let advanced = roman_rank(&roman) >= 3;

    if full != roman && mentions(&full) {
        (MatchGrade::Exact, format!("Trial names stage {full}"))
    } else if mentions(&roman) {
        let grade = if full == roman {
            MatchGrade::Exact
        } else {
            MatchGrade::FuzzyHigh
        };
        (grade, format!("Trial names stage {roman}, patient is {full}"))
    } else if advanced && (text.contains("early stage") || text.contains("early-stage")) {
        (MatchGrade::Mismatch, format!("Trial targets early-stage disease, patient is {full}"))
    } else if advanced
        && ["advanced", "metastatic", "recurrent", "persistent"]
            .iter()
            .any(|w| text.contains(w))
    {
        (MatchGrade::FuzzyMedium, format!("Trial enrolls advanced disease, patient is {full}"))
    } else if text.contains("stage") {
        (MatchGrade::FuzzyLow, format!("Trial lists other stages, patient is {full}"))
    } else {
        (MatchGrade::Unknown, "Trial does not state a stage".to_string())
    }
}

fn histology_terms(text: &str) -> Vec<&'static str> {
    let mut remaining = text.replace("non small cell", "non-small cell");
    let mut found: Vec<&'static str> = Vec::new();
    for &term in HISTOLOGY_TERMS {
        // longer terms are consumed first so "non-small cell" never reads as "small cell"
        if remaining.contains(term) {
            found.push(term);
            remaining = remaining.replace(term, " ");
        }
    }
    found
}

fn grade_histology(diagnoses: &str, text: &str) -> (MatchGrade, String) {
    let patient = histology_terms(&diagnoses.to_lowercase());
    if patient.is_empty() {
        return (MatchGrade::Unknown, "Patient histology not stated".to_string());
    }
    let trial = histology_terms(text);
    if trial.is_empty() {
        return (
            MatchGrade::FuzzyMedium,
            "Trial does not restrict histology".to_string(),
        );
    }

    let shared: Vec<&str> = patient.iter().filter(|p| trial.contains(*p)).copied().collect();
    if shared.len() == patient.len() {
        (MatchGrade::Exact, format!("Trial names {}", shared.join(", ")))
    } else if !shared.is_empty() {
        (MatchGrade::FuzzyHigh, format!("Trial names {}", shared.join(", ")))
    } else {
        (
            MatchGrade::Mismatch,
            format!("Trial histology {} differs from patient {}", trial.join(", "), patient.join(", ")),
        )
    }
}

fn grade_biomarkers(biomarkers: &str, text: &str) -> BTreeMap<String, BiomarkerMatch> {
    let patient = format!("{} ", biomarkers.to_lowercase());
    BIOMARKERS
        .iter()
        .filter(|(_, spellings)| spellings.iter().any(|s| patient.contains(s)))
        .map(|(name, spellings)| {
            let mentioned = spellings.iter().any(|s| text.contains(s.trim_end()));
            let result = if mentioned {
                BiomarkerMatch {
                    status: BiomarkerStatus::Match,
                    reasoning: format!("Trial mentions {name}"),
                }
            } else {
                BiomarkerMatch {
                    status: BiomarkerStatus::Unknown,
                    reasoning: format!("Trial does not mention {name}"),
                }
            };
            (name.to_string(), result)
        })
        .collect()
}

/// Rule-based grading of a trial against the patient's diagnosis (pure function)
pub fn grade_clinical_features(profile: &PatientProfile, trial: &TrialRecord) -> ClinicalMatch {
    let text = trial_text(trial);
    let (stage_match, stage_reasoning) = grade_stage(&profile.diagnoses, &text);
    let (histology_match, histology_reasoning) = grade_histology(&profile.diagnoses, &text);

    ClinicalMatch {
        stage_match,
        stage_reasoning,
        histology_match,
        histology_reasoning,
        biomarker_matches: grade_biomarkers(&profile.biomarkers, &text),
        clinical_score: 0.0,
    }
    .rescored()
}

/// Clinical matches per trial identifier
pub(crate) fn clinical_matches_from(memory: &SharedMemory) -> BTreeMap<String, ClinicalMatch> {
    memory.get_as(keys::CLINICAL_MATCHES).unwrap_or_default()
}

/// Trials that passed demographic matching, in ranking order
fn demographic_passing(memory: &SharedMemory) -> Vec<TrialRecord> {
    let demographics = demographic_matches_from(memory);
    eligibility_trials(memory)
        .into_iter()
        .filter(|t| demographics.get(&t.nct_id).is_some_and(|m| m.demographic_pass))
        .collect()
}

pub(crate) struct MatchClinicalFeaturesState;

#[async_trait]
impl State for MatchClinicalFeaturesState {
    fn name(&self) -> &str {
        "match_clinical_features"
    }

    fn description(&self) -> &str {
        "Match stage, histology, and biomarkers with exact and graded fuzzy logic"
    }

    fn requires_completion(&self, memory: &SharedMemory) -> bool {
        !demographic_passing(memory).is_empty()
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        "You are performing clinical feature matching using both exact and fuzzy logic.\n\n\
         For each trial, assess:\n\
         1. Stage matching (exact or compatible stages)\n\
         2. Histology matching (e.g., \"squamous\" matches \"squamous cell carcinoma\")\n\
         3. Biomarker matching (presence/absence, thresholds)\n\n\
         Grades for stage and histology: \"exact\", \"fuzzy_high\" (95%+ confidence), \
         \"fuzzy_medium\" (70-94%), \"fuzzy_low\" (50-69%), \"mismatch\".\n\
         Biomarker status: \"match\", \"partial\", \"mismatch\", \"unknown\".\n\n\
         Return a JSON object keyed by the exact NCT ID:\n\
         {\"NCT_ID\": {\"stage_match\": \"exact\", \"stage_reasoning\": \"...\", \
         \"histology_match\": \"fuzzy_high\", \"histology_reasoning\": \"...\", \
         \"biomarker_matches\": {\"PD-L1\": {\"status\": \"match\", \"reasoning\": \"...\"}}}}"
            .to_string()
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let profile = profile_from(memory);
        let mut text = format!(
            "Patient Diagnoses: {}\n\nPatient Biomarkers: {}\n\nTRIALS:\n",
            truncate_chars(&profile.diagnoses, 300),
            truncate_chars(&profile.biomarkers, 300)
        );
        for (i, trial) in demographic_passing(memory).iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, trial_block(trial)));
        }
        text
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let profile = profile_from(memory);
        let passing = demographic_passing(memory);
        let mut output = StateOutput::new();

        let parsed: BTreeMap<String, ClinicalMatch> = if passing.is_empty() {
            BTreeMap::new()
        } else {
            match extract_json(raw) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    warn!(reason = %reason, "Clinical match parsing failed, grading by rules");
                    output = output.degraded(format!("clinical features graded by rules: {reason}"));
                    BTreeMap::new()
                }
            }
        };

        let matches: BTreeMap<String, ClinicalMatch> = passing
            .iter()
            .map(|trial| {
                let graded = match find_entry(&parsed, &trial.nct_id) {
                    Some(model) => model.clone().rescored(),
                    None => grade_clinical_features(&profile, trial),
                };
                (trial.nct_id.clone(), graded)
            })
            .collect();

        let high_scoring = matches
            .values()
            .filter(|m| m.clinical_score >= super::CLINICAL_THRESHOLD)
            .count();
        info!(graded = matches.len(), high_scoring, "Clinical features matched");
        Transition::Advance(output.with_serialized(keys::CLINICAL_MATCHES, &matches))
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("assess_eligibility".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::CLINICAL_MATCHES]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_profile, sample_trial};
    use serde_json::json;

    #[test]
    fn test_weighted_score_formula() {
        let mut clinical = ClinicalMatch {
            stage_match: MatchGrade::Exact,
            histology_match: MatchGrade::FuzzyHigh,
            ..Default::default()
        };
        clinical.biomarker_matches.insert(
            "PD-L1".to_string(),
            BiomarkerMatch {
                status: BiomarkerStatus::Match,
                reasoning: String::new(),
            },
        );
        clinical.biomarker_matches.insert(
            "HPV".to_string(),
            BiomarkerMatch {
                status: BiomarkerStatus::Mismatch,
                reasoning: String::new(),
            },
        );
        // 0.3 * 1.0 + 0.3 * 0.9 + 0.4 * 0.5
        assert!((clinical.weighted_score() - 0.77).abs() < 1e-9);
    }

    #[test]
    fn test_no_biomarkers_scores_as_unknown() {
        let clinical = ClinicalMatch {
            stage_match: MatchGrade::Mismatch,
            histology_match: MatchGrade::Mismatch,
            ..Default::default()
        };
        assert!((clinical.weighted_score() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_model_score_is_recomputed() {
        let parsed: ClinicalMatch = serde_json::from_value(json!({
            "stage_match": "exact",
            "histology_match": "exact",
            "biomarker_matches": {"PD-L1": {"status": "match"}},
            "clinical_score": 0.1
        }))
        .unwrap();
        assert_eq!(parsed.rescored().clinical_score, 1.0);
    }

    #[test]
    fn test_unrecognized_grade_is_unknown() {
        let parsed: ClinicalMatch =
            serde_json::from_value(json!({"stage_match": "compatible"})).unwrap();
        assert_eq!(parsed.stage_match, MatchGrade::Unknown);
    }

    #[test]
    fn test_rule_grading_against_matching_trial() {
        let mut trial = sample_trial("NCT1", "Pembrolizumab in Stage IIIB Cervical Cancer");
        trial.brief_summary = "PD-L1 positive squamous cell carcinoma, HPV associated".to_string();

        let clinical = grade_clinical_features(&sample_profile(), &trial);
        assert_eq!(clinical.stage_match, MatchGrade::Exact);
        assert_eq!(clinical.histology_match, MatchGrade::Exact);
        assert_eq!(clinical.biomarker_matches["PD-L1"].status, BiomarkerStatus::Match);
        assert_eq!(clinical.biomarker_matches["HPV"].status, BiomarkerStatus::Match);
        assert_eq!(clinical.clinical_score, 1.0);
    }

    #[test]
    fn test_rule_grading_stage_variants() {
        let diagnosis = "Stage IIIB squamous cell carcinoma";
        assert_eq!(grade_stage(diagnosis, "stage iii disease").0, MatchGrade::FuzzyHigh);
        assert_eq!(grade_stage(diagnosis, "stage iiia only").0, MatchGrade::FuzzyLow);
        assert_eq!(grade_stage(diagnosis, "locally advanced cervical cancer").0, MatchGrade::FuzzyMedium);
        assert_eq!(grade_stage(diagnosis, "early stage cervical cancer").0, MatchGrade::Mismatch);
        assert_eq!(grade_stage("cervical cancer", "stage iiib").0, MatchGrade::Unknown);
    }

    #[test]
    fn test_histology_mismatch() {
        let (grade, _) = grade_histology("squamous cell carcinoma", "adenocarcinoma of the cervix");
        assert_eq!(grade, MatchGrade::Mismatch);
        let (grade, _) = grade_histology("adenosquamous carcinoma", "squamous cell carcinoma");
        assert_eq!(grade, MatchGrade::Mismatch);
    }

    #[test]
    fn test_non_small_cell_is_not_small_cell() {
        assert_eq!(histology_terms("non-small cell lung cancer"), vec!["non-small cell"]);
        assert_eq!(histology_terms("non small cell lung cancer"), vec!["non-small cell"]);
        assert_eq!(
            histology_terms("nsclc cohort, non-small cell; excludes small cell histology"),
            vec!["non-small cell", "small cell"]
        );

        let (grade, _) = grade_histology("Small cell lung cancer", "metastatic non-small cell lung cancer");
        assert_eq!(grade, MatchGrade::Mismatch);
        let (grade, _) = grade_histology("Non-small cell lung cancer", "stage iv non-small cell lung cancer");
        assert_eq!(grade, MatchGrade::Exact);
    }
}
