//! Idempotent consumer.
//!
//! Filters out messages whose correlation key has already been processed so
//! that downstream side effects happen at most once per key. Keys are kept in
//! an [`IdempotentRepository`]. A key is committed when the exchange
//! completes successfully and rolled back when it fails.

pub mod repository;

pub use repository::{
    ClaimSet, FileIdempotentRepository, IdempotentRepository, MemoryIdempotentRepository,
    RepositoryError,
};

use crate::config::IdempotentConfig;
use crate::exchange::properties::DUPLICATE_MESSAGE;
use crate::exchange::{Exchange, ExchangeError};
use crate::expression::{SharedExpression, evaluate_key};
use crate::processor::{AsyncCallback, AsyncProcessor, Executable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a non-eager consumer treats a key whose first exchange is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotentMode {
    /// Keys in progress count as duplicates.
    #[default]
    Strict,
    /// Only keys already in the repository count as duplicates.
    Relaxed,
}

/// Hook invoked for every duplicate before it is skipped or forwarded.
pub trait DuplicateHandler: Send + Sync {
    fn on_duplicate(&self, exchange: &mut Exchange, key: &str);
}

impl<F> DuplicateHandler for F
where
    F: Fn(&mut Exchange, &str) + Send + Sync,
{
    fn on_duplicate(&self, exchange: &mut Exchange, key: &str) {
        self(exchange, key)
    }
}

pub struct LoggingDuplicateHandler;

impl DuplicateHandler for LoggingDuplicateHandler {
    fn on_duplicate(&self, exchange: &mut Exchange, key: &str) {
        log::debug!("Exchange {} is a duplicate for key '{}'", exchange.uuid(), key);
    }
}

pub struct IdempotentConsumer {
    name: String,
    expression: SharedExpression,
    repository: Arc<dyn IdempotentRepository>,
    downstream: Executable,
    eager: bool,
    skip_duplicate: bool,
    remove_on_failure: bool,
    completion_eager: bool,
    mode: IdempotentMode,
    duplicate_handler: Arc<dyn DuplicateHandler>,
}

impl IdempotentConsumer {
    pub fn builder(
        expression: SharedExpression,
        repository: Arc<dyn IdempotentRepository>,
        downstream: Executable,
    ) -> IdempotentConsumerBuilder {
        IdempotentConsumerBuilder {
            name: String::from("idempotent-consumer"),
            expression,
            repository,
            downstream,
            config: IdempotentConfig::default(),
            duplicate_handler: Arc::new(LoggingDuplicateHandler),
        }
    }

    pub fn repository(&self) -> &Arc<dyn IdempotentRepository> {
        &self.repository
    }

    pub fn into_executable(self) -> Executable {
        Executable::Async(Arc::new(self))
    }

    /// Classifies the key, returning the claim to settle for a new key.
    fn classify(&self, key: &str) -> Option<Settlement> {
        let claimed = if self.eager {
            match self.repository.add(key) {
                Ok(added) => {
                    if !added {
                        return None;
                    }
                    false
                }
                Err(e) => {
                    log::warn!(
                        "Repository '{}' failed to add key '{}', processing as new: {}",
                        self.repository.repository_id(),
                        key,
                        e
                    );
                    false
                }
            }
        } else {
            let claimed = match self.mode {
                IdempotentMode::Relaxed => false,
                IdempotentMode::Strict => {
                    if !self.repository.try_claim(key) {
                        return None;
                    }
                    true
                }
            };
            // Checked after claiming: a settlement adds the key before it
            // releases its claim.
            match self.repository.contains(key) {
                Ok(true) => {
                    if claimed {
                        self.repository.release(key);
                    }
                    return None;
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!(
                        "Repository '{}' failed to look up key '{}', processing as new: {}",
                        self.repository.repository_id(),
                        key,
                        e
                    );
                }
            }
            claimed
        };
        Some(Settlement {
            key: key.to_string(),
            repository: self.repository.clone(),
            eager: self.eager,
            remove_on_failure: self.remove_on_failure,
            claimed,
        })
    }
}

impl AsyncProcessor for IdempotentConsumer {
    fn process_async(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let Some(key) = evaluate_key(self.expression.as_ref(), &exchange) else {
            exchange.set_failure(ExchangeError::missing_correlation_key(
                self.expression.describe(),
            ));
            callback.done(exchange, true);
            return true;
        };

        let Some(settlement) = self.classify(&key) else {
            self.duplicate_handler.on_duplicate(&mut exchange, &key);
            if self.skip_duplicate {
                exchange.stop();
                callback.done(exchange, true);
                return true;
            }
            exchange.properties_mut().insert(DUPLICATE_MESSAGE, true);
            return self.downstream.process_async(exchange, callback);
        };

        log::trace!("Exchange {} claimed key '{}'", exchange.uuid(), key);
        if self.completion_eager {
            return self.downstream.process_then(exchange, move |exchange, done_sync| {
                settlement.settle(exchange.is_failed());
                callback.done(exchange, done_sync);
                done_sync
            });
        }
        exchange.add_completion_listener(move |exchange| settlement.settle(exchange.is_failed()));
        self.downstream.process_async(exchange, callback)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Commit or rollback owed for a key that was classified as new.
struct Settlement {
    key: String,
    repository: Arc<dyn IdempotentRepository>,
    eager: bool,
    remove_on_failure: bool,
    claimed: bool,
}

impl Settlement {
    fn settle(self, failed: bool) {
        if failed {
            if self.remove_on_failure {
                if let Err(e) = self.repository.remove(&self.key) {
                    log::warn!("Could not remove key '{}' after failure: {}", self.key, e);
                }
            }
        } else {
            if !self.eager {
                if let Err(e) = self.repository.add(&self.key) {
                    log::warn!("Could not add key '{}' after success: {}", self.key, e);
                }
            }
            if let Err(e) = self.repository.confirm(&self.key) {
                log::warn!("Could not confirm key '{}': {}", self.key, e);
            }
        }
        if self.claimed {
            self.repository.release(&self.key);
        }
    }
}

pub struct IdempotentConsumerBuilder {
    name: String,
    expression: SharedExpression,
    repository: Arc<dyn IdempotentRepository>,
    downstream: Executable,
    config: IdempotentConfig,
    duplicate_handler: Arc<dyn DuplicateHandler>,
}

impl IdempotentConsumerBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Applies a config section. Later setters override it.
    pub fn config(mut self, config: &IdempotentConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.config.eager = eager;
        self
    }

    pub fn skip_duplicate(mut self, skip: bool) -> Self {
        self.config.skip_duplicate = skip;
        self
    }

    pub fn remove_on_failure(mut self, remove: bool) -> Self {
        self.config.remove_on_failure = remove;
        self
    }

    pub fn completion_eager(mut self, completion_eager: bool) -> Self {
        self.config.completion_eager = completion_eager;
        self
    }

    pub fn mode(mut self, mode: IdempotentMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn duplicate_handler(mut self, handler: impl DuplicateHandler + 'static) -> Self {
        self.duplicate_handler = Arc::new(handler);
        self
    }

    pub fn build(self) -> IdempotentConsumer {
        IdempotentConsumer {
            name: self.name,
            expression: self.expression,
            repository: self.repository,
            downstream: self.downstream,
            eager: self.config.eager,
            skip_duplicate: self.config.skip_duplicate,
            remove_on_failure: self.config.remove_on_failure,
            completion_eager: self.config.completion_eager,
            mode: self.config.mode,
            duplicate_handler: self.duplicate_handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Message;
    use crate::expression::header;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FailingRepository {
        claims: ClaimSet,
    }

    impl IdempotentRepository for FailingRepository {
        fn add(&self, _key: &str) -> Result<bool, RepositoryError> {
            Err(RepositoryError::unavailable("failing", "down"))
        }

        fn contains(&self, _key: &str) -> Result<bool, RepositoryError> {
            Err(RepositoryError::unavailable("failing", "down"))
        }

        fn remove(&self, _key: &str) -> Result<bool, RepositoryError> {
            Err(RepositoryError::unavailable("failing", "down"))
        }

        fn clear(&self) -> Result<(), RepositoryError> {
            Ok(())
        }

        fn try_claim(&self, key: &str) -> bool {
            self.claims.try_claim(key)
        }

        fn release(&self, key: &str) {
            self.claims.release(key)
        }

        fn repository_id(&self) -> &str {
            "failing"
        }
    }

    fn counting_step(counter: Arc<AtomicUsize>) -> Executable {
        Executable::from_fn("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn keyed(key: &str) -> Exchange {
        Exchange::with_message(Message::new("payload").with_header("id", key))
    }

    fn run(step: &Executable, exchange: Exchange) -> Exchange {
        let mut exchange = step.process(exchange).unwrap();
        exchange.complete();
        exchange
    }

    #[test]
    fn test_duplicate_is_stopped_not_failed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let step = IdempotentConsumer::builder(header("id"), repo.clone(), counting_step(counter.clone()))
            .build()
            .into_executable();

        let first = run(&step, keyed("k1"));
        assert!(!first.is_stopped());
        let second = run(&step, keyed("k1"));
        assert!(second.is_stopped());
        assert!(!second.is_failed());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(repo.contains("k1").unwrap());
    }

    #[test]
    fn test_missing_key_fails_without_repository_call() {
        let counter = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let step = IdempotentConsumer::builder(header("id"), repo.clone(), counting_step(counter.clone()))
            .build()
            .into_executable();
        let exchange = run(&step, Exchange::with_body("no key"));
        assert!(matches!(exchange.failure(), Some(ExchangeError::MissingCorrelationKey { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(repo.is_empty());
    }

    #[test]
    fn test_failure_rolls_back_key() {
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let failing = Executable::from_fn("fail", |_| Err(ExchangeError::processing("fail", "boom")));
        let step = IdempotentConsumer::builder(header("id"), repo.clone(), failing)
            .build()
            .into_executable();
        let exchange = run(&step, keyed("k1"));
        assert!(exchange.is_failed());
        assert!(!repo.contains("k1").unwrap());
    }

    #[test]
    fn test_failure_keeps_key_without_remove_on_failure() {
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let failing = Executable::from_fn("fail", |_| Err(ExchangeError::processing("fail", "boom")));
        let step = IdempotentConsumer::builder(header("id"), repo.clone(), failing)
            .remove_on_failure(false)
            .build()
            .into_executable();
        run(&step, keyed("k1"));
        assert!(repo.contains("k1").unwrap());
    }

    #[test]
    fn test_non_eager_adds_key_on_completion() {
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let seen_during = Arc::new(AtomicUsize::new(0));
        let r = repo.clone();
        let s = seen_during.clone();
        let downstream = Executable::from_fn("check", move |_| {
            if r.contains("k1").unwrap() {
                s.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        let step = IdempotentConsumer::builder(header("id"), repo.clone(), downstream)
            .eager(false)
            .build()
            .into_executable();
        let mut exchange = step.process(keyed("k1")).unwrap();
        assert!(!repo.contains("k1").unwrap());
        exchange.complete();
        assert!(repo.contains("k1").unwrap());
        assert_eq!(seen_during.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_strict_mode_rejects_key_in_progress() {
        let counter = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let step = IdempotentConsumer::builder(header("id"), repo, counting_step(counter.clone()))
            .eager(false)
            .build()
            .into_executable();
        let mut first = step.process(keyed("k1")).unwrap();
        let second = run(&step, keyed("k1"));
        assert!(second.is_stopped());
        first.complete();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_strict_claims_are_shared_through_the_repository() {
        let counter = Arc::new(AtomicUsize::new(0));
        let repo: Arc<dyn IdempotentRepository> = Arc::new(MemoryIdempotentRepository::new("r"));
        let left = IdempotentConsumer::builder(header("id"), repo.clone(), counting_step(counter.clone()))
            .eager(false)
            .build()
            .into_executable();
        let right = IdempotentConsumer::builder(header("id"), repo.clone(), counting_step(counter.clone()))
            .eager(false)
            .build()
            .into_executable();
        let mut first = left.process(keyed("k1")).unwrap();
        let second = run(&right, keyed("k1"));
        assert!(second.is_stopped());
        first.complete();
        assert!(repo.contains("k1").unwrap());
        assert!(repo.try_claim("k1"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_relaxed_mode_allows_key_in_progress() {
        let counter = Arc::new(AtomicUsize::new(0));
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let step = IdempotentConsumer::builder(header("id"), repo, counting_step(counter.clone()))
            .eager(false)
            .mode(IdempotentMode::Relaxed)
            .build()
            .into_executable();
        let mut first = step.process(keyed("k1")).unwrap();
        let second = run(&step, keyed("k1"));
        assert!(!second.is_stopped());
        first.complete();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_forwarded_when_not_skipped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let hooked = Arc::new(AtomicUsize::new(0));
        let h = hooked.clone();
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let step = IdempotentConsumer::builder(header("id"), repo, counting_step(counter.clone()))
            .skip_duplicate(false)
            .duplicate_handler(move |_: &mut Exchange, _: &str| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .into_executable();
        run(&step, keyed("k1"));
        let duplicate = run(&step, keyed("k1"));
        assert_eq!(duplicate.properties().get::<bool>(DUPLICATE_MESSAGE), Some(&true));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_eager_commits_before_completion() {
        let repo = Arc::new(MemoryIdempotentRepository::new("r"));
        let step = IdempotentConsumer::builder(header("id"), repo.clone(), Executable::from_fn("ok", |_| Ok(())))
            .eager(false)
            .completion_eager(true)
            .build()
            .into_executable();
        let exchange = step.process(keyed("k1")).unwrap();
        assert!(repo.contains("k1").unwrap());
        assert_eq!(exchange.listener_count(), 0);
    }

    #[test]
    fn test_store_errors_treat_key_as_new() {
        let counter = Arc::new(AtomicUsize::new(0));
        let step = IdempotentConsumer::builder(
            header("id"),
            Arc::new(FailingRepository::default()),
            counting_step(counter.clone()),
        )
        .build()
        .into_executable();
        let first = run(&step, keyed("k1"));
        let second = run(&step, keyed("k1"));
        assert!(!first.is_failed() && !second.is_failed());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
