//! Signal observation.
//!
//! Messages the correlator does not consume as a command answer are
//! published to a [`SignalHub`] as signals, together with the protocol
//! errors found while checking inbound messages. Every [`Subscription`]
//! gets its own unbounded feed, so subscriptions buffer independently from
//! the moment they are created and never affect each other.
//!
//! [`Subscription::until`] turns the feed into a "wait until X, fail on Y"
//! operation: it first settles against what is already buffered and only
//! then waits for new input.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::errors::{ObserveError, ProtocolError, UnexpectedSignal};
use crate::protocol::{Message, Signature, SignatureParseError};

const LOG_TARGET: &str = "fbp_client::observer";
const IGNORED_TARGET: &str = "fbp_client::observer::ignored";

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

type Predicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// A single signal pattern.
#[derive(Clone)]
pub enum Pattern {
    /// `protocol:command`, either side may be `*`.
    Signature(Signature),
    /// Arbitrary test over the whole signal.
    Predicate(Predicate),
}

impl Pattern {
    pub fn matches(&self, signal: &Message) -> bool {
        match self {
            Pattern::Signature(signature) => signature.matches_message(signal),
            Pattern::Predicate(predicate) => predicate(signal),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Signature(signature) => write!(f, "Signature({signature})"),
            Pattern::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A set of patterns; a signal matches when any pattern does.
#[derive(Debug, Clone)]
pub struct Matcher {
    patterns: Vec<Pattern>,
}

impl Matcher {
    /// Matches every signal.
    pub fn all() -> Self {
        Self::from(Signature::new("*", "*"))
    }

    /// Matches nothing.
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Parse a list of `protocol:command` signatures.
    pub fn parse<S: AsRef<str>>(signatures: &[S]) -> Result<Self, SignatureParseError> {
        let patterns = signatures
            .iter()
            .map(|s| s.as_ref().parse().map(Pattern::Signature))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Match with an arbitrary predicate.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self {
            patterns: vec![Pattern::Predicate(Arc::new(predicate))],
        }
    }

    /// Matches what either matcher matches.
    pub fn or(mut self, other: Matcher) -> Self {
        self.patterns.extend(other.patterns);
        self
    }

    pub fn matches(&self, signal: &Message) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(signal))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl From<Signature> for Matcher {
    fn from(signature: Signature) -> Self {
        Self {
            patterns: vec![Pattern::Signature(signature)],
        }
    }
}

impl From<Vec<Signature>> for Matcher {
    fn from(signatures: Vec<Signature>) -> Self {
        Self {
            patterns: signatures.into_iter().map(Pattern::Signature).collect(),
        }
    }
}

impl FromStr for Matcher {
    type Err = SignatureParseError;

    /// Parse a comma-separated list of signatures, e.g.
    /// `"network:stopped,network:error"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let signatures: Vec<&str> = s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        Self::parse(signatures.as_slice())
    }
}

// ---------------------------------------------------------------------------
// SignalHub
// ---------------------------------------------------------------------------

/// One item of a subscription feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Feed {
    /// An unsolicited message from the runtime.
    Signal(Message),
    /// The runtime sent something the client could not accept.
    ProtocolError(ProtocolError),
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<Feed>>,
}

/// Fan-out point for signals and protocol errors.
///
/// Cloning is cheap; all clones share the same subscribers.
#[derive(Clone, Default)]
pub struct SignalHub {
    inner: Arc<HubInner>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start buffering signals accepted by `matcher`, plus every protocol
    /// error.
    pub fn subscribe(&self, matcher: Matcher) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(id, tx);
        Subscription {
            id,
            hub: Arc::clone(&self.inner),
            matcher,
            feed: rx,
        }
    }

    /// Deliver a signal to every subscription.
    pub fn publish(&self, signal: Message) {
        self.broadcast(Feed::Signal(signal));
    }

    /// Deliver a protocol error to every subscription.
    pub fn publish_error(&self, error: ProtocolError) {
        self.broadcast(Feed::ProtocolError(error));
    }

    fn broadcast(&self, feed: Feed) {
        self.inner
            .subscribers
            .retain(|_, subscriber| subscriber.send(feed.clone()).is_ok());
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Drop every subscription's feed. Pending waits fail with
    /// [`ObserveError::Closed`] once they have drained their buffer.
    pub fn close(&self) {
        self.inner.subscribers.clear();
    }
}

impl fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A private, buffered view of the signal feed.
///
/// Dropping the subscription unregisters it from the hub.
pub struct Subscription {
    id: u64,
    hub: Arc<HubInner>,
    matcher: Matcher,
    feed: mpsc::UnboundedReceiver<Feed>,
}

enum Verdict {
    Success,
    Failure,
}

fn judge(signal: &Message, success: &Matcher, failure: &Matcher) -> Option<Verdict> {
    if failure.matches(signal) {
        Some(Verdict::Failure)
    } else if success.matches(signal) {
        Some(Verdict::Success)
    } else {
        None
    }
}

impl Subscription {
    /// Next buffered or live item of the feed.
    ///
    /// Signals outside the subscription's matcher are skipped. Returns
    /// `None` once the hub has been closed and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Feed> {
        loop {
            let feed = self.feed.recv().await?;
            if self.accepts(&feed) {
                return Some(feed);
            }
        }
    }

    /// Wait until a signal matches `success` or `failure`.
    ///
    /// Signals buffered since the subscription was created are considered
    /// first. A protocol error fails the wait ahead of any pattern match,
    /// and on a single signal `failure` is checked before `success`. On
    /// success the signals observed up to and including the matching one
    /// are returned.
    pub async fn until(mut self, success: Matcher, failure: Matcher) -> Result<Vec<Message>, ObserveError> {
        let mut signals = Vec::new();
        let mut buffered_error = None;
        while let Ok(feed) = self.feed.try_recv() {
            if !self.accepts(&feed) {
                continue;
            }
            match feed {
                Feed::Signal(signal) => signals.push(signal),
                Feed::ProtocolError(error) => {
                    buffered_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = buffered_error {
            log::debug!(target: LOG_TARGET, "Failed with buffered protocol error: {}", error);
            return Err(ObserveError::Protocol { error, signals });
        }

        let settled = signals
            .iter()
            .position(|signal| judge(signal, &success, &failure).is_some());
        if let Some(index) = settled {
            signals.truncate(index + 1);
            return Self::settle(signals, &success, &failure);
        }

        loop {
            match self.recv().await {
                None => return Err(ObserveError::Closed),
                Some(Feed::ProtocolError(error)) => {
                    log::debug!(target: LOG_TARGET, "Failed with protocol error: {}", error);
                    return Err(ObserveError::Protocol { error, signals });
                }
                Some(Feed::Signal(signal)) => {
                    let matched = judge(&signal, &success, &failure).is_some();
                    signals.push(signal);
                    if matched {
                        return Self::settle(signals, &success, &failure);
                    }
                }
            }
        }
    }

    /// Stop observing. Equivalent to dropping the subscription.
    pub fn cancel(self) {}

    fn accepts(&self, feed: &Feed) -> bool {
        match feed {
            Feed::Signal(signal) if !self.matcher.matches(signal) => {
                log::trace!(target: IGNORED_TARGET, "{}", signal.signature());
                false
            }
            Feed::Signal(signal) => {
                log::debug!(target: LOG_TARGET, "Observed {}", signal.signature());
                true
            }
            Feed::ProtocolError(_) => true,
        }
    }

    /// Settle on the last signal of `signals`.
    fn settle(
        signals: Vec<Message>,
        success: &Matcher,
        failure: &Matcher,
    ) -> Result<Vec<Message>, ObserveError> {
        let Some(last) = signals.last() else {
            return Err(ObserveError::Closed);
        };
        match judge(last, success, failure) {
            Some(Verdict::Failure) => {
                log::debug!(target: LOG_TARGET, "Failed with {}", last.signature());
                let last = last.clone();
                Err(ObserveError::Unexpected(UnexpectedSignal::from_signal(&last, signals)))
            }
            _ => {
                log::debug!(target: LOG_TARGET, "Succeeded with {}", last.signature());
                Ok(signals)
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.subscribers.remove(&self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("matcher", &self.matcher)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;
    use crate::schema::ValidationError;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, assert_ready_err, assert_ready_ok};

    fn signal(protocol: &str, command: &str) -> Message {
        Message::new(protocol, command, json!({"graph": "main"}))
    }

    fn matcher(signatures: &[&str]) -> Matcher {
        Matcher::parse(signatures).unwrap()
    }

    fn protocol_error() -> ProtocolError {
        ProtocolError::Invalid(ValidationError {
            direction: Direction::Output,
            protocol: "network".into(),
            command: "data".into(),
            detail: "missing required property id".into(),
        })
    }

    #[test]
    fn test_matcher_patterns() {
        let started = signal("network", "started");
        assert!(Matcher::all().matches(&started));
        assert!(!Matcher::none().matches(&started));
        assert!(matcher(&["network:*"]).matches(&started));
        assert!(matcher(&["*:started"]).matches(&started));
        assert!(!matcher(&["graph:*", "network:stopped"]).matches(&started));

        let predicate = Matcher::predicate(|m| m.payload_str("graph") == Some("main"));
        assert!(predicate.matches(&started));
        assert!(predicate.or(Matcher::none()).matches(&started));

        let parsed: Matcher = "network:stopped, network:error".parse().unwrap();
        assert!(parsed.matches(&signal("network", "error")));
        assert!(Matcher::parse(&["bogus"]).is_err());
    }

    #[test]
    fn test_until_settles_from_buffer() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(Matcher::all());
        hub.publish(signal("network", "started"));
        hub.publish(signal("network", "data"));
        hub.publish(signal("network", "stopped"));
        hub.publish(signal("network", "started"));

        let mut wait = tokio_test::task::spawn(
            subscription.until(matcher(&["network:stopped"]), matcher(&["network:error"])),
        );
        let signals = assert_ready_ok!(wait.poll());
        let commands: Vec<&str> = signals.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(commands, vec!["started", "data", "stopped"]);
    }

    #[test]
    fn test_buffered_failure_beats_later_success() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(Matcher::all());
        hub.publish(Message::new(
            "network",
            "processerror",
            json!({"graph": "main", "id": "Divide", "error": "division by zero"}),
        ));
        hub.publish(signal("network", "stopped"));

        let mut wait = tokio_test::task::spawn(
            subscription.until(matcher(&["network:stopped"]), matcher(&["network:processerror"])),
        );
        match assert_ready_err!(wait.poll()) {
            ObserveError::Unexpected(err) => {
                assert_eq!(err.message, "division by zero");
                assert_eq!(err.signature.to_string(), "network:processerror");
                assert_eq!(err.signals.len(), 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_failure_checked_before_success_on_same_signal() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(Matcher::all());
        hub.publish(signal("network", "stopped"));

        let mut wait = tokio_test::task::spawn(
            subscription.until(matcher(&["network:*"]), matcher(&["network:stopped"])),
        );
        let err = assert_ready_err!(wait.poll());
        assert_eq!(err.to_string(), "Unexpected network:stopped message");
    }

    #[test]
    fn test_buffered_protocol_error_beats_everything() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(Matcher::all());
        hub.publish(signal("network", "stopped"));
        hub.publish_error(protocol_error());
        hub.publish(signal("network", "error"));

        let mut wait = tokio_test::task::spawn(
            subscription.until(matcher(&["network:stopped"]), matcher(&["network:error"])),
        );
        match assert_ready_err!(wait.poll()) {
            ObserveError::Protocol { error, signals } => {
                assert_eq!(error, protocol_error());
                assert_eq!(signals.len(), 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_until_waits_for_live_signal() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(Matcher::all());
        hub.publish(signal("network", "started"));

        let mut wait = tokio_test::task::spawn(
            subscription.until(matcher(&["network:stopped"]), matcher(&["network:error"])),
        );
        assert_pending!(wait.poll());

        hub.publish(signal("network", "data"));
        assert!(wait.is_woken());
        assert_pending!(wait.poll());

        hub.publish(signal("network", "stopped"));
        let signals = assert_ready_ok!(wait.poll());
        assert_eq!(signals.len(), 3);
        assert!(signals[2].is("network", "stopped"));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_live_protocol_error_fails_wait() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(Matcher::all());
        let mut wait = tokio_test::task::spawn(
            subscription.until(matcher(&["network:stopped"]), Matcher::none()),
        );
        assert_pending!(wait.poll());
        hub.publish_error(protocol_error());
        assert!(matches!(
            assert_ready_err!(wait.poll()),
            ObserveError::Protocol { .. }
        ));
    }

    #[test]
    fn test_subscribe_matcher_filters_signals() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(matcher(&["network:*"]));
        // Outside the subscription, so it cannot settle the wait.
        hub.publish(signal("graph", "clear"));

        let mut wait = tokio_test::task::spawn(
            subscription.until(Matcher::all(), Matcher::none()),
        );
        assert_pending!(wait.poll());
        hub.publish(signal("network", "started"));
        let signals = assert_ready_ok!(wait.poll());
        assert_eq!(signals, vec![signal("network", "started")]);
    }

    #[test]
    fn test_subscriptions_are_isolated() {
        let hub = SignalHub::new();
        let first = hub.subscribe(Matcher::all());
        let mut second = hub.subscribe(Matcher::all());
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(signal("network", "stopped"));
        let mut wait = tokio_test::task::spawn(
            first.until(matcher(&["network:stopped"]), Matcher::none()),
        );
        assert_ready_ok!(wait.poll());
        assert_eq!(hub.subscriber_count(), 1);

        // The second subscription still has its own copy.
        let mut next = tokio_test::task::spawn(second.recv());
        assert_eq!(
            assert_ready!(next.poll()),
            Some(Feed::Signal(signal("network", "stopped")))
        );
    }

    #[test]
    fn test_closed_hub_ends_wait() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(Matcher::all());
        let mut wait = tokio_test::task::spawn(
            subscription.until(matcher(&["network:stopped"]), Matcher::none()),
        );
        assert_pending!(wait.poll());
        hub.close();
        assert!(matches!(assert_ready_err!(wait.poll()), ObserveError::Closed));
    }

    #[test]
    fn test_cancel_unregisters() {
        let hub = SignalHub::new();
        let subscription = hub.subscribe(Matcher::all());
        assert_eq!(hub.subscriber_count(), 1);
        subscription.cancel();
        assert_eq!(hub.subscriber_count(), 0);
        // Publishing without subscribers is fine.
        hub.publish(signal("network", "started"));
    }
}
