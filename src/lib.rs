pub mod classifier;
pub mod config;
pub mod graph;
pub mod sweeper;

pub use classifier::{Classifier, Message, ScoreResult, SPAM_THRESHOLD};
pub use config::{ActionMode, RuleSet, Settings};
pub use graph::{GraphClient, GraphError, MailClient};
pub use sweeper::{CycleReport, SweepOptions, Sweeper};
