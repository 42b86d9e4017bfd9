use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// What to do with a message that scores at or above the spam threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    Move,
    Delete,
}

impl FromStr for ActionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "move" => Ok(ActionMode::Move),
            "delete" => Ok(ActionMode::Delete),
            other => anyhow::bail!("invalid action mode '{other}' (expected 'move' or 'delete')"),
        }
    }
}

/// The rule tables the classifier scores against. All matching is
/// case-insensitive substring containment; weights and the spam threshold
/// are fixed in the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub high_risk_domains: Vec<String>,
    pub spam_subject_phrases: Vec<String>,
    pub spam_body_keywords: Vec<String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet {
            high_risk_domains: vec![
                "casino-winner.com".to_string(),
                "cryptoinvest.net".to_string(),
                "lotterywinners.org".to_string(),
                "freemoney.biz".to_string(),
                "spamville.net".to_string(),
                "phishing-site.com".to_string(),
                "fake-bank.org".to_string(),
                "sketchy-offers.net".to_string(),
                "too-good-to-be-true.com".to_string(),
            ],
            spam_subject_phrases: vec![
                "urgent".to_string(),
                "act now".to_string(),
                "limited time".to_string(),
                "congratulations you won".to_string(),
                "claim your prize".to_string(),
                "winner".to_string(),
                "lottery".to_string(),
                "free money".to_string(),
                "exclusive offer".to_string(),
                "risk free".to_string(),
                "guaranteed income".to_string(),
            ],
            spam_body_keywords: vec![
                "casino".to_string(),
                "viagra".to_string(),
                "crypto".to_string(),
                "bitcoin".to_string(),
                "investment opportunity".to_string(),
                "weight loss".to_string(),
                "make money fast".to_string(),
                "work from home".to_string(),
                "lose weight fast".to_string(),
                "click here now".to_string(),
                "limited spots available".to_string(),
            ],
        }
    }
}

impl RuleSet {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let rules: RuleSet = serde_yaml::from_str(&content)?;
        Ok(rules)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Process configuration sourced from the environment. Credentials are
/// required; everything else has a default.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub mailbox: String,
    pub action: ActionMode,
    pub poll_interval: Duration,
    pub lookback: Duration,
    pub max_results: usize,
}

const ENV_TENANT_ID: &str = "MAILSWEEP_TENANT_ID";
const ENV_CLIENT_ID: &str = "MAILSWEEP_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "MAILSWEEP_CLIENT_SECRET";
const ENV_MAILBOX: &str = "MAILSWEEP_MAILBOX";
const ENV_ACTION: &str = "MAILSWEEP_ACTION";
const ENV_POLL_INTERVAL: &str = "MAILSWEEP_POLL_INTERVAL";
const ENV_LOOKBACK_MINUTES: &str = "MAILSWEEP_LOOKBACK_MINUTES";
const ENV_MAX_RESULTS: &str = "MAILSWEEP_MAX_RESULTS";

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let tenant_id = required(ENV_TENANT_ID)?;
        let client_id = required(ENV_CLIENT_ID)?;
        let client_secret = required(ENV_CLIENT_SECRET)?;
        let mailbox = required(ENV_MAILBOX)?;

        let action = match optional(ENV_ACTION) {
            Some(value) => value.parse::<ActionMode>()?,
            None => ActionMode::Move,
        };

        let poll_interval = Duration::from_secs(parse_or(ENV_POLL_INTERVAL, 60)?);
        let lookback = Duration::from_secs(parse_or(ENV_LOOKBACK_MINUTES, 5)? * 60);
        let max_results = parse_or(ENV_MAX_RESULTS, 50)? as usize;

        Ok(Settings {
            tenant_id,
            client_id,
            client_secret,
            mailbox,
            action,
            poll_interval,
            lookback,
            max_results,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(name: &str) -> anyhow::Result<String> {
    optional(name).ok_or_else(|| anyhow::anyhow!("missing required environment variable {name}"))
}

fn parse_or(name: &str, default: u64) -> anyhow::Result<u64> {
    match optional(name) {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("invalid value for {name}: '{value}'")),
        None => Ok(default),
    }
}
