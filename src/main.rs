use clap::{Arg, Command};
use log::LevelFilter;
use mailsweep::classifier::{Classifier, Message};
use mailsweep::config::{RuleSet, Settings};
use mailsweep::graph::{GraphClient, MailClient};
use mailsweep::sweeper::{SweepOptions, Sweeper};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("mailsweep")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Junk-folder spam sweeper for Microsoft Graph mailboxes")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Rule-set file path (built-in rules when omitted)"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write the default rule set to a file and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the rule set and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("score")
                .long("score")
                .value_name("FILE")
                .help("Classify a YAML-described message and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run a single poll cycle instead of the continuous sweep")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_rules(generate_path);
        return;
    }

    let rules = match load_rules(matches.get_one::<String>("config")) {
        Ok(rules) => rules,
        Err(e) => {
            eprintln!("Error loading rule set: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Rule set loaded:");
        println!("  {} high-risk domains", rules.high_risk_domains.len());
        println!("  {} subject phrases", rules.spam_subject_phrases.len());
        println!("  {} body keywords", rules.spam_body_keywords.len());
        return;
    }

    let classifier = match Classifier::new(rules) {
        Ok(classifier) => classifier,
        Err(e) => {
            eprintln!("Error building classifier: {e}");
            process::exit(1);
        }
    };

    if let Some(message_file) = matches.get_one::<String>("score") {
        score_message_file(&classifier, message_file);
        return;
    }

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            eprintln!(
                "Required: MAILSWEEP_TENANT_ID, MAILSWEEP_CLIENT_ID, \
                 MAILSWEEP_CLIENT_SECRET, MAILSWEEP_MAILBOX"
            );
            process::exit(1);
        }
    };

    let mut client = GraphClient::new(
        settings.tenant_id.clone(),
        settings.client_id.clone(),
        settings.client_secret.clone(),
        settings.mailbox.clone(),
    );

    // Startup authentication failure is fatal; during the run it only
    // triggers a backoff and retry.
    if let Err(e) = client.ensure_authenticated().await {
        log::error!("Initial authentication failed: {e}");
        process::exit(1);
    }

    let options = SweepOptions::from(&settings);
    let mut sweeper = Sweeper::new(client, classifier, options);

    if matches.get_flag("once") {
        match sweeper.poll_once().await {
            Ok(report) => {
                log::info!(
                    "Cycle complete: {} fetched, {} new, {} spam actioned, {} seen total",
                    report.fetched,
                    report.new_messages,
                    report.spam_actioned,
                    sweeper.seen_count()
                );
            }
            Err(e) => {
                log::error!("Poll cycle failed: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, stopping after the current cycle");
        cancel_flag.store(true, Ordering::SeqCst);
    }) {
        eprintln!("Error setting signal handler: {e}");
        process::exit(1);
    }

    sweeper.run(cancel).await;
}

fn load_rules(path: Option<&String>) -> anyhow::Result<RuleSet> {
    match path {
        Some(path) => RuleSet::from_file(path),
        None => Ok(RuleSet::default()),
    }
}

fn generate_default_rules(path: &str) {
    match RuleSet::default().to_file(path) {
        Ok(()) => {
            println!("Default rule set written to: {path}");
            println!("Edit the lists to suit your mailbox.");
        }
        Err(e) => {
            eprintln!("Error writing rule set: {e}");
            process::exit(1);
        }
    }
}

fn score_message_file(classifier: &Classifier, path: &str) {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading message file: {e}");
            process::exit(1);
        }
    };

    let message: Message = match serde_yaml::from_str(&content) {
        Ok(message) => message,
        Err(e) => {
            eprintln!("Error parsing message file: {e}");
            process::exit(1);
        }
    };

    let result = classifier.classify(&message);
    println!("Score: {}", result.score);
    println!("Verdict: {}", if result.is_spam { "SPAM" } else { "CLEAN" });
    if result.matched_rules.is_empty() {
        println!("No rules matched");
    } else {
        println!("Matched rules:");
        for rule in &result.matched_rules {
            println!("  - {rule}");
        }
    }
}
