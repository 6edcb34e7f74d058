//! The subscription engine: resumable, retrying delivery of change-feed
//! events to user callbacks.
//!
//! Each subscription runs on its own tokio task and delivers serially: the
//! next event is not polled until the callback for the previous one has
//! returned. Positions persist through a [`PositionStorage`] after the
//! callback succeeds, so a restarted subscription resumes where it left off
//! and delivery is at-least-once.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::errors::{SubscriptionError, SubscriptionResult};
use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::retry::RetryStrategy;
use crate::subscription::{
    ChangeFeed, ChangeFeedCursor, ChangeFeedEvent, PositionStorage, StartAt, SubscriptionAction,
    SubscriptionPosition,
};
use crate::types::SubscriptionId;

/// When the engine persists a delivered event's position.
#[derive(Clone)]
pub enum PersistencePolicy {
    /// Persist after every successful callback. The default.
    EveryEvent,
    /// Persist after every N successful callbacks.
    EveryN(NonZeroU32),
    /// Persist only for events matching the predicate.
    Filtered(Arc<dyn Fn(&CloudEvent) -> bool + Send + Sync>),
}

impl std::fmt::Debug for PersistencePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EveryEvent => write!(f, "EveryEvent"),
            Self::EveryN(n) => write!(f, "EveryN({n})"),
            Self::Filtered(_) => write!(f, "Filtered(..)"),
        }
    }
}

/// Configuration for the subscription engine.
#[derive(Debug, Clone)]
pub struct SubscriptionEngineConfig {
    /// Retry strategy for failing user callbacks. Unbounded by default:
    /// giving up on a callback would drop the event.
    pub callback_retry: RetryStrategy,
    /// Retry strategy for re-establishing a closed or failing feed cursor.
    pub feed_retry: RetryStrategy,
    /// When positions persist after successful delivery.
    pub persistence: PersistencePolicy,
    /// How long shutdown waits for in-flight callbacks before aborting
    /// their workers.
    pub shutdown_grace: Duration,
}

impl Default for SubscriptionEngineConfig {
    fn default() -> Self {
        Self {
            callback_retry: RetryStrategy::unbounded(),
            feed_retry: RetryStrategy::feed_reopen(),
            persistence: PersistencePolicy::EveryEvent,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// The lifecycle state of one subscription, observable through its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// The worker is resolving its start position and opening the feed.
    Starting,
    /// The worker is delivering events.
    Running,
    /// The subscription stopped because the feed could not be re-established
    /// or its callback retries were exhausted.
    Failed(String),
    /// The subscription was cancelled or shut down.
    Cancelled,
}

/// A handle to a running subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    status: watch::Receiver<SubscriptionStatus>,
}

impl SubscriptionHandle {
    /// The subscription's id.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// The current lifecycle state.
    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    /// Waits until the status satisfies the predicate, returning the status
    /// that did. Returns the last observed status if the subscription's
    /// worker exits first.
    pub async fn wait_for(
        &mut self,
        predicate: impl Fn(&SubscriptionStatus) -> bool,
    ) -> SubscriptionStatus {
        loop {
            let current = self.status.borrow().clone();
            if predicate(&current) {
                return current;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

struct ActiveSubscription {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Drives change subscriptions over a [`ChangeFeed`] and persists their
/// positions in a [`PositionStorage`].
///
/// # Examples
///
/// ```ignore
/// let engine = SubscriptionEngine::new(feed, storage);
/// let handle = engine
///     .subscribe(subscription_id, None, StartAt::now(), |event: CloudEvent| async move {
///         println!("{}", event.id());
///         Ok(())
///     })
///     .await?;
/// ```
pub struct SubscriptionEngine<F: ChangeFeed, P: PositionStorage> {
    feed: Arc<F>,
    positions: Arc<P>,
    config: SubscriptionEngineConfig,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
    shut_down: AtomicBool,
}

impl<F: ChangeFeed, P: PositionStorage> SubscriptionEngine<F, P> {
    /// Creates an engine with the default configuration.
    pub fn new(feed: F, positions: P) -> Self {
        Self::with_config(feed, positions, SubscriptionEngineConfig::default())
    }

    /// Creates an engine with a custom configuration.
    pub fn with_config(feed: F, positions: P, config: SubscriptionEngineConfig) -> Self {
        Self {
            feed: Arc::new(feed),
            positions: Arc::new(positions),
            config,
            subscriptions: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The position storage this engine persists into.
    pub fn positions(&self) -> &P {
        &self.positions
    }

    /// Starts a subscription.
    ///
    /// If a position is persisted for `id` it wins over `start_at`;
    /// otherwise `StartAt::Now` is resolved to the feed's current tail and
    /// persisted before the first delivery, so a crash before any event
    /// still resumes from the right place.
    ///
    /// # Errors
    ///
    /// * [`SubscriptionError::AlreadySubscribed`] if `id` is already running.
    /// * [`SubscriptionError::ShutDown`] after [`SubscriptionEngine::shutdown`].
    pub async fn subscribe(
        &self,
        id: SubscriptionId,
        filter: Option<Filter>,
        start_at: StartAt,
        action: impl SubscriptionAction,
    ) -> SubscriptionResult<SubscriptionHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SubscriptionError::ShutDown);
        }

        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Starting);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let worker = run_subscription(
            Arc::clone(&self.feed),
            Arc::clone(&self.positions),
            self.config.clone(),
            id.clone(),
            filter,
            start_at,
            Arc::new(action),
            status_tx,
            cancel_rx,
        );

        let mut subscriptions = self
            .subscriptions
            .lock()
            .expect("subscription map lock poisoned");
        if let Some(existing) = subscriptions.get(&id) {
            if existing.task.is_finished() {
                subscriptions.remove(&id);
            } else {
                return Err(SubscriptionError::AlreadySubscribed(id));
            }
        }

        let task = tokio::spawn(worker);
        subscriptions.insert(
            id.clone(),
            ActiveSubscription {
                cancel: cancel_tx,
                task,
            },
        );

        Ok(SubscriptionHandle {
            id,
            status: status_rx,
        })
    }

    /// Starts a subscription at the current tail of the feed with no filter.
    pub async fn subscribe_from_now(
        &self,
        id: SubscriptionId,
        action: impl SubscriptionAction,
    ) -> SubscriptionResult<SubscriptionHandle> {
        self.subscribe(id, None, StartAt::now(), action).await
    }

    /// Cancels one subscription and waits for its worker to finish.
    ///
    /// Cancellation is observed at the next suspension point; an event
    /// already inside the callback runs to completion first, and its
    /// position is not persisted.
    pub async fn cancel(&self, id: &SubscriptionId) -> SubscriptionResult<()> {
        let subscription = self
            .subscriptions
            .lock()
            .expect("subscription map lock poisoned")
            .remove(id)
            .ok_or_else(|| SubscriptionError::NotSubscribed(id.clone()))?;

        let _ = subscription.cancel.send(());
        if let Err(e) = subscription.task.await {
            if !e.is_cancelled() {
                warn!(subscription = %id, error = %e, "subscription worker panicked");
            }
        }
        Ok(())
    }

    /// Cancels every subscription and releases the engine's resources.
    ///
    /// Idempotent. In-flight callbacks get [`shutdown_grace`] to finish;
    /// workers still running afterwards are aborted.
    ///
    /// [`shutdown_grace`]: SubscriptionEngineConfig::shutdown_grace
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);

        let drained: Vec<(SubscriptionId, ActiveSubscription)> = self
            .subscriptions
            .lock()
            .expect("subscription map lock poisoned")
            .drain()
            .collect();

        for (id, subscription) in drained {
            let _ = subscription.cancel.send(());
            let abort = subscription.task.abort_handle();
            match time::timeout(self.config.shutdown_grace, subscription.task).await {
                Ok(Ok(())) => debug!(subscription = %id, "subscription stopped"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(subscription = %id, error = %e, "subscription worker panicked")
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(subscription = %id, "subscription did not stop within the grace window");
                    abort.abort();
                }
            }
        }
    }
}

/// A cancellation signal that stays observable after it fires.
struct CancelSignal {
    rx: oneshot::Receiver<()>,
    fired: bool,
}

impl CancelSignal {
    fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx, fired: false }
    }

    /// Non-blocking check, usable between suspension points.
    fn is_cancelled(&mut self) -> bool {
        if self.fired {
            return true;
        }
        match self.rx.try_recv() {
            Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                self.fired = true;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
        }
    }

    /// Resolves when cancellation is requested.
    async fn cancelled(&mut self) {
        if self.fired {
            return;
        }
        let _ = (&mut self.rx).await;
        self.fired = true;
    }
}

enum Delivery {
    Completed,
    Cancelled,
    Exhausted(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_subscription<F: ChangeFeed, P: PositionStorage>(
    feed: Arc<F>,
    positions: Arc<P>,
    config: SubscriptionEngineConfig,
    id: SubscriptionId,
    filter: Option<Filter>,
    start_at: StartAt,
    action: Arc<dyn SubscriptionAction>,
    status: watch::Sender<SubscriptionStatus>,
    cancel: oneshot::Receiver<()>,
) {
    let mut cancel = CancelSignal::new(cancel);

    let start = match resolve_start(&*feed, &*positions, &id, start_at).await {
        Ok(start) => start,
        Err(e) => {
            error!(subscription = %id, error = %e, "failed to resolve start position");
            let _ = status.send(SubscriptionStatus::Failed(e.to_string()));
            return;
        }
    };
    let mut last_position = match &start {
        StartAt::Position(p) => Some(p.clone()),
        StartAt::Now => None,
    };

    let mut cursor =
        match open_cursor(&*feed, &start, filter.as_ref(), &config.feed_retry, &mut cancel).await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => {
                let _ = status.send(SubscriptionStatus::Cancelled);
                return;
            }
            Err(e) => {
                error!(subscription = %id, error = %e, "failed to open change feed");
                let _ = status.send(SubscriptionStatus::Failed(e.to_string()));
                return;
            }
        };

    let _ = status.send(SubscriptionStatus::Running);
    debug!(subscription = %id, "subscription running");
    let mut delivered_since_persist = 0u32;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = cursor.next() => next,
        };

        match next {
            Ok(Some(feed_event)) => {
                match deliver(&*action, &feed_event, &config.callback_retry, &mut cancel).await {
                    Delivery::Completed => {
                        last_position = Some(feed_event.position.clone());
                        if should_persist(
                            &config.persistence,
                            &feed_event.event,
                            &mut delivered_since_persist,
                        ) {
                            if let Err(e) = positions.save(&id, &feed_event.position).await {
                                warn!(subscription = %id, error = %e, "failed to persist position");
                            }
                        }
                    }
                    Delivery::Cancelled => break,
                    Delivery::Exhausted(reason) => {
                        error!(subscription = %id, reason = %reason, "callback retries exhausted");
                        let _ = status.send(SubscriptionStatus::Failed(reason));
                        return;
                    }
                }
            }
            Ok(None) | Err(_) => {
                if let Err(e) = &next {
                    warn!(subscription = %id, error = %e, "change feed error, reopening");
                } else {
                    debug!(subscription = %id, "change feed closed, reopening");
                }
                let resume = last_position
                    .clone()
                    .map_or(StartAt::Now, StartAt::Position);
                match open_cursor(&*feed, &resume, filter.as_ref(), &config.feed_retry, &mut cancel)
                    .await
                {
                    Ok(Some(reopened)) => cursor = reopened,
                    Ok(None) => break,
                    Err(e) => {
                        error!(subscription = %id, error = %e, "could not re-establish change feed");
                        let _ = status.send(SubscriptionStatus::Failed(e.to_string()));
                        return;
                    }
                }
            }
        }
    }

    debug!(subscription = %id, "subscription cancelled");
    let _ = status.send(SubscriptionStatus::Cancelled);
}

/// Picks the effective start: a persisted position wins; `Now` is resolved
/// to the feed's tail and persisted before the first delivery.
async fn resolve_start<F: ChangeFeed, P: PositionStorage>(
    feed: &F,
    positions: &P,
    id: &SubscriptionId,
    requested: StartAt,
) -> SubscriptionResult<StartAt> {
    if let Some(persisted) = positions.read(id).await? {
        return Ok(StartAt::Position(persisted));
    }
    match requested {
        StartAt::Position(p) => Ok(StartAt::Position(p)),
        StartAt::Now => {
            let current = feed.current_position().await?;
            positions.save(id, &current).await?;
            Ok(StartAt::Position(current))
        }
    }
}

/// Opens a cursor, retrying transient failures. `Ok(None)` means cancelled.
async fn open_cursor<F: ChangeFeed>(
    feed: &F,
    start: &StartAt,
    filter: Option<&Filter>,
    retry: &RetryStrategy,
    cancel: &mut CancelSignal,
) -> Result<Option<F::Cursor>, SubscriptionError> {
    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match feed.open(start, filter).await {
            Ok(cursor) => return Ok(Some(cursor)),
            Err(e) => {
                attempts += 1;
                if !retry.allows_attempt(attempts) {
                    return Err(SubscriptionError::Failed(e.to_string()));
                }
                let delay = retry.calculate_delay(attempts);
                warn!(error = %e, attempts, ?delay, "change feed open failed, backing off");
                tokio::select! {
                    () = time::sleep(delay) => {}
                    () = cancel.cancelled() => return Ok(None),
                }
            }
        }
    }
}

/// Invokes the callback, retrying failures with the same event. The
/// callback always runs to completion; cancellation is only observed
/// between attempts and after a successful return, in which case the
/// caller must not persist the position.
async fn deliver(
    action: &dyn SubscriptionAction,
    feed_event: &ChangeFeedEvent,
    retry: &RetryStrategy,
    cancel: &mut CancelSignal,
) -> Delivery {
    let mut attempts = 0u32;
    loop {
        match action.handle(feed_event.event.clone()).await {
            Ok(()) => {
                return if cancel.is_cancelled() {
                    Delivery::Cancelled
                } else {
                    Delivery::Completed
                };
            }
            Err(e) => {
                attempts += 1;
                warn!(
                    event = feed_event.event.id(),
                    error = %e,
                    attempts,
                    "event callback failed"
                );
                if cancel.is_cancelled() {
                    return Delivery::Cancelled;
                }
                if !retry.allows_attempt(attempts) {
                    return Delivery::Exhausted(e.to_string());
                }
                let delay = retry.calculate_delay(attempts);
                tokio::select! {
                    () = time::sleep(delay) => {}
                    () = cancel.cancelled() => return Delivery::Cancelled,
                }
            }
        }
    }
}

fn should_persist(
    policy: &PersistencePolicy,
    event: &CloudEvent,
    delivered_since_persist: &mut u32,
) -> bool {
    match policy {
        PersistencePolicy::EveryEvent => true,
        PersistencePolicy::EveryN(n) => {
            *delivered_since_persist += 1;
            if *delivered_since_persist >= n.get() {
                *delivered_since_persist = 0;
                true
            } else {
                false
            }
        }
        PersistencePolicy::Filtered(predicate) => predicate(event),
    }
}
