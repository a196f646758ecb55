//! Eligibility assessment and final recommendations

use super::clinical::{clinical_matches_from, BiomarkerStatus, ClinicalMatch, MatchGrade};
use super::criteria::{demographic_matches_from, DemographicMatch};
use super::{
    eligibility_trials, find_entry, CLINICAL_THRESHOLD, MAX_RECOMMENDATIONS, MIN_RECOMMENDATIONS,
};
use crate::parsing::{as_score, extract_json, extract_validated, truncate_chars};
use crate::pipelines::profile_from;
use crate::state_machine::keys;
use crate::state_machine::{SharedMemory, State, StateOutput, Transition};
use crate::tools::TrialRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Likelihood that the patient qualifies for a trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityTier {
    HighlyLikely,
    Likely,
    Possible,
    Unlikely,
}

impl EligibilityTier {
    /// Tier implied by a clinical score alone
    pub fn from_clinical_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::HighlyLikely
        } else if score >= 0.8 {
            Self::Likely
        } else {
            Self::Possible
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "highly_likely" => Some(Self::HighlyLikely),
            "likely" => Some(Self::Likely),
            "possible" => Some(Self::Possible),
            "unlikely" => Some(Self::Unlikely),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighlyLikely => "highly_likely",
            Self::Likely => "likely",
            Self::Possible => "possible",
            Self::Unlikely => "unlikely",
        }
    }
}

/// Detailed assessment of one clinically matching trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityAssessment {
    pub overall_eligibility: EligibilityTier,
    /// 0.0..=1.0
    pub confidence: f64,
    pub clinical_score: f64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub barriers: Vec<String>,
    #[serde(default)]
    pub missing_data: Vec<String>,
    pub model_assessed: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelCriterionAssessment {
    #[serde(default)]
    missing_data: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelAssessment {
    #[serde(default)]
    overall_eligibility: Option<String>,
    #[serde(default)]
    confidence: Option<Value>,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    barriers: Vec<String>,
    #[serde(default)]
    missing_data: Vec<String>,
    #[serde(default)]
    complex_criteria_assessment: Vec<ModelCriterionAssessment>,
}

/// Confidence in 0..=1, accepting percentages
fn normalize_confidence(value: f64) -> f64 {
    let value = if value > 1.0 { value / 100.0 } else { value };
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Assessment derived from clinical grades alone (pure function)
pub fn assessment_from_clinical(clinical: &ClinicalMatch) -> EligibilityAssessment {
    let mut strengths = Vec::new();
    let mut missing_data = Vec::new();

    for (label, grade, reasoning) in [
        ("Stage", clinical.stage_match, &clinical.stage_reasoning),
        ("Histology", clinical.histology_match, &clinical.histology_reasoning),
    ] {
        match grade {
            MatchGrade::Exact | MatchGrade::FuzzyHigh => {
                strengths.push(format!("{label}: {reasoning}"));
            }
            MatchGrade::Unknown => missing_data.push(format!("{label} compatibility")),
            _ => {}
        }
    }
    for (marker, result) in &clinical.biomarker_matches {
        match result.status {
            BiomarkerStatus::Match => strengths.push(format!("{marker} status matches")),
            BiomarkerStatus::Unknown => missing_data.push(format!("{marker} requirement")),
            _ => {}
        }
    }

    EligibilityAssessment {
        overall_eligibility: EligibilityTier::from_clinical_score(clinical.clinical_score),
        confidence: normalize_confidence(clinical.clinical_score),
        clinical_score: clinical.clinical_score,
        strengths,
        barriers: Vec::new(),
        missing_data,
        model_assessed: false,
    }
}

fn assessment_from_model(model: &ModelAssessment, clinical: &ClinicalMatch) -> EligibilityAssessment {
    let fallback = assessment_from_clinical(clinical);
    let mut missing_data = model.missing_data.clone();
    for item in model
        .complex_criteria_assessment
        .iter()
        .flat_map(|c| c.missing_data.iter())
    {
        if !missing_data.contains(item) {
            missing_data.push(item.clone());
        }
    }

    EligibilityAssessment {
        overall_eligibility: model
            .overall_eligibility
            .as_deref()
            .and_then(EligibilityTier::parse)
            .unwrap_or(fallback.overall_eligibility),
        confidence: model
            .confidence
            .as_ref()
            .and_then(as_score)
            .map(normalize_confidence)
            .unwrap_or(fallback.confidence),
        clinical_score: clinical.clinical_score,
        strengths: if model.strengths.is_empty() {
            fallback.strengths
        } else {
            model.strengths.clone()
        },
        barriers: model.barriers.clone(),
        missing_data,
        model_assessed: true,
    }
}

/// Trials clearing the clinical threshold, in ranking order, with their matches
fn assessable(memory: &SharedMemory) -> Vec<(TrialRecord, ClinicalMatch)> {
    let clinical = clinical_matches_from(memory);
    eligibility_trials(memory)
        .into_iter()
        .filter_map(|trial| {
            let matched = clinical.get(&trial.nct_id)?.clone();
            (matched.clinical_score >= CLINICAL_THRESHOLD).then_some((trial, matched))
        })
        .collect()
}

pub(crate) fn assessments_from(memory: &SharedMemory) -> BTreeMap<String, EligibilityAssessment> {
    memory.get_as(keys::ELIGIBILITY_ASSESSMENTS).unwrap_or_default()
}

pub(crate) struct AssessEligibilityState;

#[async_trait]
impl State for AssessEligibilityState {
    fn name(&self) -> &str {
        "assess_eligibility"
    }

    fn description(&self) -> &str {
        "Evaluate complex criteria with chain-of-thought reasoning"
    }

    fn requires_completion(&self, memory: &SharedMemory) -> bool {
        !assessable(memory).is_empty()
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        "You are a clinical trial eligibility expert performing detailed assessment.\n\n\
         Evaluate complex criteria that require medical reasoning: adequate organ function, \
         life expectancy, active brain metastases, prior treatment requirements, washout periods, \
         and contraindications. Reason step by step for each criterion.\n\n\
         Confidence scoring:\n\
         - 0.9-1.0: all criteria clearly met\n\
         - 0.7-0.89: most criteria met, minor gaps\n\
         - 0.5-0.69: some criteria met, significant gaps\n\
         - below 0.5: major barriers present\n\n\
         Return a JSON object keyed by the exact NCT ID:\n\
         {\"NCT_ID\": {\"complex_criteria_assessment\": [{\"criterion\": \"adequate organ function\", \
         \"assessment\": \"likely_eligible\", \"confidence\": 0.7, \"reasoning\": \"...\", \
         \"missing_data\": [\"Liver function tests\"]}], \
         \"overall_eligibility\": \"highly_likely | likely | possible | unlikely\", \
         \"confidence\": 0.75, \"barriers\": [\"...\"], \"strengths\": [\"...\"]}}"
            .to_string()
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let profile = profile_from(memory);
        let mut text = format!(
            "PATIENT:\n- Diagnoses: {}\n- Biomarkers: {}\n- Treatment history: {}\n\nTRIALS:\n",
            truncate_chars(&profile.diagnoses, 300),
            truncate_chars(&profile.biomarkers, 300),
            truncate_chars(&profile.treatment_history, 300),
        );
        for (trial, clinical) in assessable(memory) {
            text.push_str(&format!(
                "- {} | {} | clinical score {:.2}\n  Criteria: {}\n",
                trial.nct_id,
                trial.title,
                clinical.clinical_score,
                truncate_chars(&trial.criteria_snippet, 400)
            ));
        }
        text
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let candidates = assessable(memory);
        let mut output = StateOutput::new();

        let parsed: BTreeMap<String, ModelAssessment> = if candidates.is_empty() {
            BTreeMap::new()
        } else {
            match extract_json(raw) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    warn!(reason = %reason, "Eligibility assessment parsing failed, using clinical tiers");
                    output = output.degraded(format!("eligibility tiered from clinical scores: {reason}"));
                    BTreeMap::new()
                }
            }
        };

        let assessments: BTreeMap<String, EligibilityAssessment> = candidates
            .iter()
            .map(|(trial, clinical)| {
                let assessment = match find_entry(&parsed, &trial.nct_id) {
                    Some(model) => assessment_from_model(model, clinical),
                    None => assessment_from_clinical(clinical),
                };
                (trial.nct_id.clone(), assessment)
            })
            .collect();

        let likely = assessments
            .values()
            .filter(|a| a.overall_eligibility <= EligibilityTier::Likely)
            .count();
        info!(assessed = assessments.len(), likely, "Eligibility assessed");
        Transition::Advance(output.with_serialized(keys::ELIGIBILITY_ASSESSMENTS, &assessments))
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("generate_recommendations".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::ELIGIBILITY_ASSESSMENTS]
    }
}

/// One final recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub rank: usize,
    pub nct_id: String,
    pub trial_title: String,
    pub match_score: f64,
    pub eligibility_status: String,
    pub strengths: Vec<String>,
    pub concerns: Vec<String>,
    pub required_actions: Vec<String>,
    pub estimated_time_to_enrollment: String,
    pub location: String,
    /// Identifier is present in the ranked trials
    pub verified: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelRecommendation {
    #[serde(default)]
    rank: Option<Value>,
    #[serde(default)]
    nct_id: String,
    #[serde(default)]
    trial_title: String,
    #[serde(default)]
    match_score: Option<Value>,
    #[serde(default)]
    eligibility_status: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    concerns: Vec<String>,
    #[serde(default)]
    required_actions: Vec<String>,
    #[serde(default)]
    estimated_time_to_enrollment: String,
    #[serde(default)]
    location: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelReport {
    #[serde(default)]
    top_matches: Vec<ModelRecommendation>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    overall_recommendation: String,
}

/// Final report written by `generate_recommendations`
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationReport {
    pub recommendations: Vec<Recommendation>,
    pub summary: String,
    pub overall_recommendation: String,
}

fn default_summary(recommendations: &[Recommendation], analyzed: usize) -> String {
    if analyzed == 0 {
        return "No trials were available for eligibility analysis".to_string();
    }
    let likely = recommendations
        .iter()
        .filter(|r| {
            EligibilityTier::parse(&r.eligibility_status)
                .is_some_and(|tier| tier <= EligibilityTier::Likely)
        })
        .count();
    format!(
        "{} trials recommended from {} analyzed; {} assessed as likely or better",
        recommendations.len(),
        analyzed,
        likely
    )
}

fn default_overall(recommendations: &[Recommendation]) -> String {
    match recommendations.first() {
        Some(top) => format!(
            "Discuss {} ({}) with the treating oncologist",
            top.nct_id, top.trial_title
        ),
        None => "No suitable trials identified".to_string(),
    }
}

fn recommendation_from_model(
    model: &ModelRecommendation,
    ranked: &[TrialRecord],
) -> Recommendation {
    let record = ranked
        .iter()
        .find(|t| t.nct_id.eq_ignore_ascii_case(model.nct_id.trim()));
    if record.is_none() {
        warn!(nct_id = %model.nct_id, "Recommendation cites a trial absent from the ranking");
    }
    let or_record = |value: &str, field: fn(&TrialRecord) -> &str| {
        if value.trim().is_empty() {
            record.map(field).unwrap_or_default().to_string()
        } else {
            value.trim().to_string()
        }
    };

    Recommendation {
        rank: 0,
        nct_id: model.nct_id.trim().to_string(),
        trial_title: or_record(&model.trial_title, |t| t.title.as_str()),
        match_score: model
            .match_score
            .as_ref()
            .and_then(as_score)
            .or(record.map(|t| t.score))
            .unwrap_or_default(),
        eligibility_status: model.eligibility_status.trim().to_string(),
        strengths: model.strengths.clone(),
        concerns: model.concerns.clone(),
        required_actions: model.required_actions.clone(),
        estimated_time_to_enrollment: model.estimated_time_to_enrollment.trim().to_string(),
        location: or_record(&model.location, |t| t.location.as_str()),
        verified: record.is_some(),
    }
}

/// Recommendations synthesized from prior stages (pure function)
///
/// Assessed trials come first, ordered by tier then confidence; the ranking
/// pads the list to at least three where available, never beyond five.
/// Trials that failed the demographic screen are never used as padding.
pub fn synthesize_recommendations(
    ranked: &[TrialRecord],
    assessments: &BTreeMap<String, EligibilityAssessment>,
    demographics: &BTreeMap<String, DemographicMatch>,
) -> Vec<Recommendation> {
    let mut assessed: Vec<(&TrialRecord, &EligibilityAssessment)> = ranked
        .iter()
        .filter_map(|t| assessments.get(&t.nct_id).map(|a| (t, a)))
        .collect();
    assessed.sort_by(|(_, a), (_, b)| {
        a.overall_eligibility
            .cmp(&b.overall_eligibility)
            .then(b.confidence.total_cmp(&a.confidence))
    });

    let mut recommendations: Vec<Recommendation> = assessed
        .into_iter()
        .take(MAX_RECOMMENDATIONS)
        .map(|(trial, assessment)| {
            let mut required_actions = vec!["Confirm eligibility with the trial team".to_string()];
            required_actions.extend(assessment.missing_data.iter().map(|m| format!("Obtain {m}")));
            let mut concerns = assessment.barriers.clone();
            concerns.extend(assessment.missing_data.iter().map(|m| format!("Unverified: {m}")));
            Recommendation {
                rank: 0,
                nct_id: trial.nct_id.clone(),
                trial_title: trial.title.clone(),
                match_score: trial.score,
                eligibility_status: assessment.overall_eligibility.as_str().to_string(),
                strengths: assessment.strengths.clone(),
                concerns,
                required_actions,
                estimated_time_to_enrollment: "Unknown".to_string(),
                location: trial.location.clone(),
                verified: true,
            }
        })
        .collect();

    for trial in ranked {
        if recommendations.len() >= MIN_RECOMMENDATIONS {
            break;
        }
        if recommendations.iter().any(|r| r.nct_id == trial.nct_id) {
            continue;
        }
        if demographics
            .get(&trial.nct_id)
            .is_some_and(|m| !m.demographic_pass)
        {
            continue;
        }
        recommendations.push(Recommendation {
            rank: 0,
            nct_id: trial.nct_id.clone(),
            trial_title: trial.title.clone(),
            match_score: trial.score,
            eligibility_status: "not_assessed".to_string(),
            strengths: vec![format!("Ranked with score {:.0}", trial.score)],
            concerns: vec!["Eligibility not assessed in detail".to_string()],
            required_actions: vec!["Review full eligibility criteria on ClinicalTrials.gov".to_string()],
            estimated_time_to_enrollment: "Unknown".to_string(),
            location: trial.location.clone(),
            verified: true,
        });
    }

    for (i, recommendation) in recommendations.iter_mut().enumerate() {
        recommendation.rank = i + 1;
    }
    recommendations
}

/// Final report from model output, or synthesized when it is unusable
fn build_report(raw: &str, memory: &SharedMemory) -> (RecommendationReport, Option<String>) {
    let ranked = eligibility_trials(memory);

    let model = if ranked.is_empty() {
        Err("no ranked trials".to_string())
    } else {
        extract_validated(raw, |report: &ModelReport| {
            if report.top_matches.iter().any(|m| !m.nct_id.trim().is_empty()) {
                Ok(())
            } else {
                Err("report has no top matches".to_string())
            }
        })
    };

    match model {
        Ok(report) => {
            let mut ordered: Vec<(Option<f64>, &ModelRecommendation)> = report
                .top_matches
                .iter()
                .filter(|m| !m.nct_id.trim().is_empty())
                .map(|m| (m.rank.as_ref().and_then(as_score), m))
                .collect();
            ordered.sort_by(|(a, _), (b, _)| match (a, b) {
                (Some(a), Some(b)) => a.total_cmp(b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });

            let recommendations: Vec<Recommendation> = ordered
                .into_iter()
                .take(MAX_RECOMMENDATIONS)
                .enumerate()
                .map(|(i, (_, m))| Recommendation {
                    rank: i + 1,
                    ..recommendation_from_model(m, &ranked)
                })
                .collect();

            let summary = if report.summary.trim().is_empty() {
                default_summary(&recommendations, ranked.len())
            } else {
                report.summary.trim().to_string()
            };
            let overall_recommendation = if report.overall_recommendation.trim().is_empty() {
                default_overall(&recommendations)
            } else {
                report.overall_recommendation.trim().to_string()
            };
            (
                RecommendationReport {
                    recommendations,
                    summary,
                    overall_recommendation,
                },
                None,
            )
        }
        Err(reason) => {
            let recommendations = synthesize_recommendations(
                &ranked,
                &assessments_from(memory),
                &demographic_matches_from(memory),
            );
            let report = RecommendationReport {
                summary: default_summary(&recommendations, ranked.len()),
                overall_recommendation: default_overall(&recommendations),
                recommendations,
            };
            let degraded = (!ranked.is_empty()).then_some(reason);
            (report, degraded)
        }
    }
}

pub(crate) struct GenerateRecommendationsState;

#[async_trait]
impl State for GenerateRecommendationsState {
    fn name(&self) -> &str {
        "generate_recommendations"
    }

    fn description(&self) -> &str {
        "Synthesize assessments into actionable recommendations"
    }

    fn requires_completion(&self, memory: &SharedMemory) -> bool {
        !eligibility_trials(memory).is_empty()
    }

    fn instruction(&self, memory: &SharedMemory) -> String {
        let mut text = String::from("HERE ARE THE ACTUAL CLINICAL TRIALS YOU MUST USE:\n\n");
        for (i, trial) in eligibility_trials(memory).iter().enumerate() {
            text.push_str(&format!(
                "Trial {}:\n  NCT ID: {}\n  Title: {}\n  Phase: {}\n  Status: {}\n  Location: {}\n\n",
                i + 1,
                trial.nct_id,
                trial.title,
                trial.phase,
                trial.status,
                trial.location
            ));
        }
        text.push_str(&format!(
            "PATIENT CONTEXT:\n{}\n\n",
            truncate_chars(&profile_from(memory).diagnoses, 300)
        ));
        text.push_str(
            "CRITICAL INSTRUCTIONS:\n\
             1. Use ONLY the EXACT NCT IDs and titles listed above\n\
             2. DO NOT create, invent, or modify any NCT ID\n\
             3. Each recommendation MUST reference a trial from the list above\n\n\
             Create a JSON report with the 3-5 most relevant trials:\n\
             {\"top_matches\": [{\"rank\": 1, \"nct_id\": \"<EXACT NCT ID>\", \"trial_title\": \"<EXACT title>\", \
             \"match_score\": 85, \"eligibility_status\": \"highly_likely\", \"strengths\": [\"...\"], \
             \"concerns\": [\"...\"], \"required_actions\": [\"...\"], \
             \"estimated_time_to_enrollment\": \"2-4 weeks\", \"location\": \"<location>\"}], \
             \"summary\": \"Brief summary of findings\", \"overall_recommendation\": \"Primary recommendation\"}\n\n\
             Return ONLY valid JSON.",
        );
        text
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let clinical: BTreeMap<String, f64> = clinical_matches_from(memory)
            .into_iter()
            .map(|(id, m)| (id, m.clinical_score))
            .collect();
        let prior = json!({
            "demographic_matches": memory.get(keys::DEMOGRAPHIC_MATCHES),
            "clinical_scores": clinical,
            "eligibility_assessments": assessments_from(memory),
        });
        format!(
            "Generate final recommendations by synthesizing all assessments:\n{}",
            serde_json::to_string_pretty(&prior).unwrap_or_default()
        )
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let (report, degraded) = build_report(raw, memory);
        let mut output = StateOutput::new();
        if let Some(reason) = degraded {
            warn!(reason = %reason, "Recommendation parsing failed, synthesizing from assessments");
            output = output.degraded(format!("recommendations synthesized: {reason}"));
        }

        let unverified = report.recommendations.iter().filter(|r| !r.verified).count();
        info!(
            recommendations = report.recommendations.len(),
            unverified,
            "Recommendations generated"
        );

        Transition::Advance(
            output
                .with_serialized(keys::RECOMMENDATIONS, &report.recommendations)
                .with(keys::ELIGIBILITY_SUMMARY, json!(report.summary))
                .with(keys::OVERALL_RECOMMENDATION, json!(report.overall_recommendation))
                .with(keys::ANALYSIS_COMPLETE, json!(true)),
        )
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        None
    }

    fn writes(&self) -> &'static [&'static str] {
        &[
            keys::RECOMMENDATIONS,
            keys::ELIGIBILITY_SUMMARY,
            keys::OVERALL_RECOMMENDATION,
            keys::ANALYSIS_COMPLETE,
        ]
    }
}
