use crate::classifier::Classifier;
use crate::config::{ActionMode, Settings};
use crate::graph::{GraphError, MailClient};

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Junk folder is both the source being swept and the move destination.
const JUNK_FOLDER: &str = "junkemail";

/// Cooperative throttle between per-message remote calls.
const MESSAGE_DELAY: Duration = Duration::from_millis(100);

/// Backoff after a failed poll cycle.
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Backoff after a failed credential exchange during the continuous run.
const AUTH_BACKOFF: Duration = Duration::from_secs(300);

/// Counters from a single fetch-classify-act pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages the remote query returned.
    pub fetched: usize,
    /// Messages not previously seen, i.e. actually evaluated.
    pub new_messages: usize,
    /// Spam messages successfully moved or deleted.
    pub spam_actioned: usize,
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub action: ActionMode,
    pub lookback: Duration,
    pub max_results: usize,
    pub poll_interval: Duration,
}

impl From<&Settings> for SweepOptions {
    fn from(settings: &Settings) -> Self {
        SweepOptions {
            action: settings.action,
            lookback: settings.lookback,
            max_results: settings.max_results,
            poll_interval: settings.poll_interval,
        }
    }
}

/// Owns the poll loop state: the mail client, the classifier and the set of
/// message ids already evaluated in this process run. Single-threaded by
/// construction; nothing here needs locking.
pub struct Sweeper<C: MailClient> {
    client: C,
    classifier: Classifier,
    options: SweepOptions,
    seen: HashSet<String>,
}

impl<C: MailClient> Sweeper<C> {
    pub fn new(client: C, classifier: Classifier, options: SweepOptions) -> Self {
        Sweeper {
            client,
            classifier,
            options,
            seen: HashSet::new(),
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// One fetch-classify-act pass. A rejected bearer token propagates so
    /// the run loop can re-authenticate; any other fetch failure aborts the
    /// cycle with an empty report. Every evaluated id is marked seen, even
    /// when the action fails.
    pub async fn poll_once(&mut self) -> Result<CycleReport, GraphError> {
        let lookback = ChronoDuration::from_std(self.options.lookback)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let cutoff = Utc::now() - lookback;

        let batch = match self
            .client
            .list_recent(JUNK_FOLDER, cutoff, self.options.max_results)
            .await
        {
            Ok(batch) => batch,
            Err(GraphError::Unauthorized(status)) => {
                return Err(GraphError::Unauthorized(status))
            }
            Err(e) => {
                log::error!("Error retrieving recent messages: {e}");
                return Ok(CycleReport::default());
            }
        };

        let fetched = batch.len();
        let new_messages: Vec<_> = batch
            .into_iter()
            .filter(|message| !self.seen.contains(&message.id))
            .collect();

        if !new_messages.is_empty() {
            log::info!("Found {} new messages to process", new_messages.len());
        }

        let new_count = new_messages.len();
        let mut spam_actioned = 0;

        for message in new_messages {
            let result = self.classifier.classify(&message);

            if result.is_spam {
                log::info!(
                    "SPAM DETECTED (Score: {}) - Rules: {}",
                    result.score,
                    result.matched_rules.join(", ")
                );
                match self.options.action {
                    ActionMode::Move => {
                        match self.client.move_message(&message.id, JUNK_FOLDER).await {
                            Ok(()) => {
                                spam_actioned += 1;
                                log::info!(
                                    "MOVED TO JUNK - From: {} | Subject: {} | Score: {}",
                                    message.sender_address,
                                    truncate_subject(&message.subject),
                                    result.score
                                );
                            }
                            Err(e) => {
                                log::error!("Error moving message {}: {e}", message.id);
                            }
                        }
                    }
                    ActionMode::Delete => match self.client.delete_message(&message.id).await {
                        Ok(()) => {
                            spam_actioned += 1;
                            log::info!(
                                "DELETED SPAM - From: {} | Subject: {} | Score: {}",
                                message.sender_address,
                                truncate_subject(&message.subject),
                                result.score
                            );
                        }
                        Err(e) => {
                            log::error!("Error deleting message {}: {e}", message.id);
                        }
                    },
                }
            } else {
                log::info!(
                    "CLEAN - From: {} | Subject: {} | Score: {}",
                    message.sender_address,
                    truncate_subject(&message.subject),
                    result.score
                );
            }

            // Seen regardless of verdict or action outcome: at most one
            // evaluation per id per process run.
            self.seen.insert(message.id);

            tokio::time::sleep(MESSAGE_DELAY).await;
        }

        if new_count > 0 {
            log::info!("Processed {new_count} messages, {spam_actioned} spam actioned");
        }

        Ok(CycleReport {
            fetched,
            new_messages: new_count,
            spam_actioned,
        })
    }

    /// Continuous sweep until the cancel flag is set. Recoverable errors
    /// never end the loop: auth failures back off 300s, other poll failures
    /// 60s. A rejected token triggers one immediate re-authentication;
    /// further consecutive rejections back off like any other poll failure.
    pub async fn run(&mut self, cancel: Arc<AtomicBool>) {
        log::info!(
            "Starting continuous sweep (interval {}s, action {:?})",
            self.options.poll_interval.as_secs(),
            self.options.action
        );

        let mut rejected_tokens = 0u32;

        while !cancel.load(Ordering::SeqCst) {
            if let Err(e) = self.client.ensure_authenticated().await {
                log::error!(
                    "Authentication failed: {e}; retrying in {}s",
                    AUTH_BACKOFF.as_secs()
                );
                if !wait_or_cancel(AUTH_BACKOFF, &cancel).await {
                    break;
                }
                continue;
            }

            match self.poll_once().await {
                Ok(_) => {
                    rejected_tokens = 0;
                    if !wait_or_cancel(self.options.poll_interval, &cancel).await {
                        break;
                    }
                }
                Err(GraphError::Unauthorized(status)) => {
                    self.client.invalidate_token();
                    rejected_tokens += 1;
                    if rejected_tokens == 1 {
                        log::warn!("Access token rejected, re-authenticating");
                    } else {
                        // A freshly issued token was rejected too, so this
                        // is not an expiry condition. Stop hammering the
                        // token endpoint.
                        log::error!(
                            "Access token rejected again (status {status}); retrying in {}s",
                            ERROR_BACKOFF.as_secs()
                        );
                        if !wait_or_cancel(ERROR_BACKOFF, &cancel).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    log::error!(
                        "Unexpected error during poll cycle: {e}; retrying in {}s",
                        ERROR_BACKOFF.as_secs()
                    );
                    if !wait_or_cancel(ERROR_BACKOFF, &cancel).await {
                        break;
                    }
                }
            }
        }

        log::info!("Sweep loop stopped");
    }
}

/// Sleep for `duration`, waking every second to honor the cancel flag.
/// Returns false when cancelled.
async fn wait_or_cancel(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let slice = (deadline - now).min(Duration::from_secs(1));
        tokio::time::sleep(slice).await;
    }
}

fn truncate_subject(subject: &str) -> String {
    const MAX: usize = 50;
    if subject.chars().count() <= MAX {
        subject.to_string()
    } else {
        let head: String = subject.chars().take(MAX).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Message;
    use crate::config::RuleSet;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    struct FakeClient {
        batch: Vec<Message>,
        fail_list: Option<fn() -> GraphError>,
        fail_actions: bool,
        list_calls: Mutex<u32>,
        // Sets the flag once the Nth list call happens, so run-loop tests
        // terminate deterministically.
        cancel_after_lists: Option<(u32, Arc<AtomicBool>)>,
        move_calls: Mutex<Vec<String>>,
        delete_calls: Mutex<Vec<String>>,
    }

    impl FakeClient {
        fn with_batch(batch: Vec<Message>) -> Self {
            FakeClient {
                batch,
                fail_list: None,
                fail_actions: false,
                list_calls: Mutex::new(0),
                cancel_after_lists: None,
                move_calls: Mutex::new(Vec::new()),
                delete_calls: Mutex::new(Vec::new()),
            }
        }

        fn list_call_count(&self) -> u32 {
            *self.list_calls.lock().unwrap()
        }

        fn moves(&self) -> Vec<String> {
            self.move_calls.lock().unwrap().clone()
        }

        fn deletes(&self) -> Vec<String> {
            self.delete_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailClient for FakeClient {
        async fn ensure_authenticated(&mut self) -> Result<(), GraphError> {
            Ok(())
        }

        fn invalidate_token(&mut self) {}

        async fn list_recent(
            &self,
            _folder: &str,
            _since: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<Message>, GraphError> {
            let calls = {
                let mut calls = self.list_calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if let Some((after, flag)) = &self.cancel_after_lists {
                if calls >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            if let Some(make_err) = self.fail_list {
                return Err(make_err());
            }
            Ok(self.batch.clone())
        }

        async fn move_message(&self, id: &str, _destination: &str) -> Result<(), GraphError> {
            self.move_calls.lock().unwrap().push(id.to_string());
            if self.fail_actions {
                return Err(GraphError::Api {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(())
        }

        async fn delete_message(&self, id: &str) -> Result<(), GraphError> {
            self.delete_calls.lock().unwrap().push(id.to_string());
            if self.fail_actions {
                return Err(GraphError::Api {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    fn options(action: ActionMode) -> SweepOptions {
        SweepOptions {
            action,
            lookback: Duration::from_secs(300),
            max_results: 50,
            poll_interval: Duration::from_secs(60),
        }
    }

    fn spam_message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            subject: "Hi".to_string(),
            sender_address: format!("promo-{id}@casino-winner.com"),
            sender_name: "Promo Team".to_string(),
            body: String::new(),
            received: Utc::now(),
        }
    }

    fn clean_message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            subject: "Project update".to_string(),
            sender_address: "jane.doe@company.com".to_string(),
            sender_name: "Jane Doe".to_string(),
            body: "see attached report".to_string(),
            received: Utc::now(),
        }
    }

    fn sweeper(client: FakeClient, action: ActionMode) -> Sweeper<FakeClient> {
        let classifier = Classifier::new(RuleSet::default()).unwrap();
        Sweeper::new(client, classifier, options(action))
    }

    #[tokio::test]
    async fn test_clean_messages_are_not_actioned() {
        let client = FakeClient::with_batch(vec![clean_message("c1"), clean_message("c2")]);
        let mut sweeper = sweeper(client, ActionMode::Move);

        let report = sweeper.poll_once().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.new_messages, 2);
        assert_eq!(report.spam_actioned, 0);
        assert!(sweeper.client_mut().moves().is_empty());
        assert!(sweeper.client_mut().deletes().is_empty());
        assert_eq!(sweeper.seen_count(), 2);
    }

    #[tokio::test]
    async fn test_move_mode_moves_and_never_deletes() {
        let client = FakeClient::with_batch(vec![spam_message("s1")]);
        let mut sweeper = sweeper(client, ActionMode::Move);

        let report = sweeper.poll_once().await.unwrap();
        assert_eq!(report.spam_actioned, 1);
        assert_eq!(sweeper.client_mut().moves(), vec!["s1".to_string()]);
        assert!(sweeper.client_mut().deletes().is_empty());
    }

    #[tokio::test]
    async fn test_delete_mode_deletes_and_never_moves() {
        let client = FakeClient::with_batch(vec![spam_message("s1")]);
        let mut sweeper = sweeper(client, ActionMode::Delete);

        let report = sweeper.poll_once().await.unwrap();
        assert_eq!(report.spam_actioned, 1);
        assert_eq!(sweeper.client_mut().deletes(), vec!["s1".to_string()]);
        assert!(sweeper.client_mut().moves().is_empty());
    }

    #[tokio::test]
    async fn test_seen_ids_are_excluded_on_later_cycles() {
        let client = FakeClient::with_batch(vec![spam_message("s1"), clean_message("c1")]);
        let mut sweeper = sweeper(client, ActionMode::Move);

        let first = sweeper.poll_once().await.unwrap();
        assert_eq!(first.new_messages, 2);
        assert_eq!(first.spam_actioned, 1);

        // Same batch again: everything is already seen.
        let second = sweeper.poll_once().await.unwrap();
        assert_eq!(second.fetched, 2);
        assert_eq!(second.new_messages, 0);
        assert_eq!(second.spam_actioned, 0);
        assert_eq!(sweeper.client_mut().moves(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_action_failure_still_marks_seen() {
        let mut client = FakeClient::with_batch(vec![spam_message("s1")]);
        client.fail_actions = true;
        let mut sweeper = sweeper(client, ActionMode::Move);

        let first = sweeper.poll_once().await.unwrap();
        assert_eq!(first.spam_actioned, 0);
        assert_eq!(sweeper.seen_count(), 1);

        // No retry on the next cycle even though the action failed.
        let second = sweeper.poll_once().await.unwrap();
        assert_eq!(second.new_messages, 0);
        assert_eq!(sweeper.client_mut().moves().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_yields_empty_cycle() {
        let mut client = FakeClient::with_batch(vec![spam_message("s1")]);
        client.fail_list = Some(|| GraphError::Api {
            status: 500,
            body: "boom".to_string(),
        });
        let mut sweeper = sweeper(client, ActionMode::Move);

        let report = sweeper.poll_once().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(sweeper.seen_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_token_propagates() {
        let mut client = FakeClient::with_batch(vec![]);
        client.fail_list = Some(|| GraphError::Unauthorized(401));
        let mut sweeper = sweeper(client, ActionMode::Move);

        let result = sweeper.poll_once().await;
        assert!(matches!(result, Err(GraphError::Unauthorized(401))));
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let client = FakeClient::with_batch(vec![]);
        let mut sweeper = sweeper(client, ActionMode::Move);

        let cancel = Arc::new(AtomicBool::new(true));
        // Returns immediately instead of entering a poll cycle.
        sweeper.run(cancel).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sleeps_interval_between_cycles_until_cancelled() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut client = FakeClient::with_batch(vec![]);
        client.cancel_after_lists = Some((2, Arc::clone(&cancel)));
        let mut sweeper = sweeper(client, ActionMode::Move);

        let start = Instant::now();
        sweeper.run(cancel).await;

        // Two cycles with one full poll-interval sleep between them, then
        // the interval wait notices the flag and stops.
        assert_eq!(sweeper.client_mut().list_call_count(), 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_token_rejection_backs_off() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut client = FakeClient::with_batch(vec![]);
        client.fail_list = Some(|| GraphError::Unauthorized(403));
        client.cancel_after_lists = Some((3, Arc::clone(&cancel)));
        let mut sweeper = sweeper(client, ActionMode::Move);

        let start = Instant::now();
        sweeper.run(cancel).await;

        // One immediate re-auth after the first rejection; the second
        // consecutive rejection waits out the error backoff instead of
        // spinning on the token endpoint.
        assert_eq!(sweeper.client_mut().list_call_count(), 3);
        assert!(start.elapsed() >= ERROR_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_or_cancel_honors_mid_wait_cancellation() {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        let completed = wait_or_cancel(Duration::from_secs(300), &cancel).await;
        assert!(!completed);
        // Woken by the next one-second slice, long before the deadline.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_or_cancel_completes_without_cancellation() {
        let cancel = AtomicBool::new(false);
        assert!(wait_or_cancel(Duration::from_secs(5), &cancel).await);
    }

    #[test]
    fn test_truncate_subject() {
        assert_eq!(truncate_subject("short"), "short");
        let long = "x".repeat(60);
        let truncated = truncate_subject(&long);
        assert!(truncated.starts_with(&"x".repeat(50)));
        assert!(truncated.ends_with("..."));
    }
}
