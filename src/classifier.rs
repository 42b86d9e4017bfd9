use crate::config::RuleSet;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Score at or above which a message is treated as spam.
pub const SPAM_THRESHOLD: u32 = 20;

const SCORE_HIGH_RISK_DOMAIN: u32 = 100;
const SCORE_SUBJECT_PHRASE: u32 = 15;
const SCORE_BODY_KEYWORD: u32 = 10;
const SCORE_EXCESSIVE_CAPS: u32 = 10;
const SCORE_EXCLAMATION_RUN: u32 = 5;
const SCORE_DIGIT_RUN_SENDER: u32 = 5;
const SCORE_MISSING_SENDER_NAME: u32 = 5;

/// A message as fetched from the mailbox. Absent fields are empty strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub sender_address: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub body: String,
    #[serde(default = "Utc::now")]
    pub received: DateTime<Utc>,
}

/// Outcome of classifying one message: the accumulated score, the matched
/// rules in the order they fired, and the verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreResult {
    pub score: u32,
    pub matched_rules: Vec<String>,
    pub is_spam: bool,
}

pub struct Classifier {
    rules: RuleSet,
    excessive_caps: Regex,
    exclamation_run: Regex,
    digit_run: Regex,
}

impl Classifier {
    pub fn new(rules: RuleSet) -> anyhow::Result<Self> {
        // Pre-compiled once; classify runs on every fetched message.
        Ok(Classifier {
            rules,
            excessive_caps: Regex::new(r"\b[A-Z]{3,}\b.*\b[A-Z]{3,}\b")?,
            exclamation_run: Regex::new(r"!{2,}")?,
            digit_run: Regex::new(r"\d{5,}")?,
        })
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Score a message against the rule tables. Pure and deterministic:
    /// the same message always yields the same result.
    pub fn classify(&self, message: &Message) -> ScoreResult {
        let subject_lower = message.subject.to_lowercase();
        let sender_lower = message.sender_address.to_lowercase();
        let body_lower = message.body.to_lowercase();

        let mut score = 0u32;
        let mut matched_rules = Vec::new();

        // High-risk domains score once, on the first match only.
        for domain in &self.rules.high_risk_domains {
            if sender_lower.contains(domain.as_str()) {
                score += SCORE_HIGH_RISK_DOMAIN;
                matched_rules.push(format!("High-risk domain: {domain}"));
                break;
            }
        }

        for phrase in &self.rules.spam_subject_phrases {
            if subject_lower.contains(phrase.as_str()) {
                score += SCORE_SUBJECT_PHRASE;
                matched_rules.push(format!("Spam subject: {phrase}"));
            }
        }

        for keyword in &self.rules.spam_body_keywords {
            if body_lower.contains(keyword.as_str()) {
                score += SCORE_BODY_KEYWORD;
                matched_rules.push(format!("Spam keyword: {keyword}"));
            }
        }

        // Pattern rules fire at most once each. Caps and exclamation checks
        // run against the raw subject, not the lowercased copy.
        if self.excessive_caps.is_match(&message.subject) {
            score += SCORE_EXCESSIVE_CAPS;
            matched_rules.push("Excessive caps in subject".to_string());
        }

        if self.exclamation_run.is_match(&message.subject) {
            score += SCORE_EXCLAMATION_RUN;
            matched_rules.push("Multiple exclamation marks".to_string());
        }

        if self.digit_run.is_match(&message.sender_address) {
            score += SCORE_DIGIT_RUN_SENDER;
            matched_rules.push("Numbers in sender email".to_string());
        }

        if message.sender_name.trim().len() < 3 {
            score += SCORE_MISSING_SENDER_NAME;
            matched_rules.push("Missing or short sender name".to_string());
        }

        ScoreResult {
            score,
            matched_rules,
            is_spam: score >= SPAM_THRESHOLD,
        }
    }
}
