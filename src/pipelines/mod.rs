//! Concrete pipelines built from states
//!
//! Patient Profile → Trial Discovery → Knowledge Enhancement → Eligibility.
//! Each module exposes a `build_*_machine` constructor; every call returns a
//! fresh machine with empty memory.

pub mod discovery;
pub mod eligibility;
pub mod knowledge;
pub mod patient_profile;

use crate::state_machine::keys;
use crate::state_machine::SharedMemory;
use crate::tools::TrialRecord;

pub use patient_profile::{Demographics, PatientProfile};

/// Substring → fallback query set, first match wins
const CANCER_QUERY_TABLE: &[(&[&str], [&str; 5])] = &[
    (&["cervical", "cervix"], [
        "cervical cancer",
        "advanced cervical cancer",
        "cervical cancer treatment",
        "cervical cancer HPV",
        "cervical carcinoma",
    ]),
    (&["breast"], [
        "breast cancer",
        "metastatic breast cancer",
        "breast cancer treatment",
        "breast carcinoma",
        "invasive breast cancer",
    ]),
    (&["lung"], [
        "lung cancer",
        "advanced lung cancer",
        "lung cancer treatment",
        "non-small cell lung cancer",
        "lung carcinoma",
    ]),
    (&["colorectal", "colon", "rectal"], [
        "colorectal cancer",
        "metastatic colorectal cancer",
        "colorectal cancer treatment",
        "colon cancer",
        "colorectal carcinoma",
    ]),
    (&["appendiceal", "appendix", "pseudomyxoma"], [
        "appendiceal cancer",
        "peritoneal cancer",
        "appendiceal adenocarcinoma",
        "colorectal cancer",
        "gastrointestinal cancer",
    ]),
    (&["ovarian", "ovary"], [
        "ovarian cancer",
        "advanced ovarian cancer",
        "ovarian cancer treatment",
        "ovarian carcinoma",
        "gynecologic cancer",
    ]),
    (&["prostate"], [
        "prostate cancer",
        "metastatic prostate cancer",
        "prostate cancer treatment",
        "prostate carcinoma",
        "castration resistant prostate cancer",
    ]),
    (&["pancrea"], [
        "pancreatic cancer",
        "advanced pancreatic cancer",
        "pancreatic cancer treatment",
        "pancreatic adenocarcinoma",
        "gastrointestinal cancer",
    ]),
];

/// Rule-based query set for a diagnosis, if it names a known cancer type
pub fn cancer_type_queries(diagnosis: &str) -> Option<Vec<String>> {
    let lower = diagnosis.to_lowercase();
    CANCER_QUERY_TABLE
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, queries)| queries.iter().map(|q| q.to_string()).collect())
}

/// Patient profile seeded into a downstream machine; empty when absent
pub(crate) fn profile_from(memory: &SharedMemory) -> PatientProfile {
    memory
        .get_as::<PatientProfile>(keys::PATIENT_PROFILE)
        .unwrap_or_default()
}

/// Trial list under `key`; empty when absent
pub(crate) fn trials_from(memory: &SharedMemory, key: &str) -> Vec<TrialRecord> {
    memory.get_as::<Vec<TrialRecord>>(key).unwrap_or_default()
}

/// First meaningful line of free text, bounded for prompt use
pub(crate) fn headline(text: &str, max_chars: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("**"))
        .unwrap_or("");
    crate::parsing::truncate_chars(line, max_chars)
}
