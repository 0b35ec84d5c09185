use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use enclave_types::events::ClientCommand;

/// A session is disconnected once it has collected more than this many
/// rate-limit warnings. The counter lives in the session and only resets
/// by reconnecting.
pub const MAX_RATE_LIMIT_WARNINGS: u32 = 5;

/// Rate-limit class of an inbound command. Commands in the same class
/// share one window per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageSend,
    DirectMessageSend,
    TypingSignal,
    ChannelJoin,
    RealmJoin,
    Other,
}

impl EventKind {
    pub fn of(cmd: &ClientCommand) -> Self {
        match cmd {
            ClientCommand::SendMessage { .. } => EventKind::MessageSend,
            ClientCommand::SendDirectMessage { .. } => EventKind::DirectMessageSend,
            ClientCommand::Typing | ClientCommand::StopTyping => EventKind::TypingSignal,
            ClientCommand::JoinChannel { .. } | ClientCommand::JoinThread { .. } => {
                EventKind::ChannelJoin
            }
            ClientCommand::JoinRealm { .. } => EventKind::RealmJoin,
            _ => EventKind::Other,
        }
    }

    fn profile(self) -> LimitProfile {
        match self {
            EventKind::MessageSend => LimitProfile::new(30, 60),
            EventKind::DirectMessageSend => LimitProfile::new(30, 60),
            EventKind::TypingSignal => LimitProfile::new(60, 60),
            EventKind::ChannelJoin => LimitProfile::new(20, 60),
            EventKind::RealmJoin => LimitProfile::new(10, 60),
            EventKind::Other => LimitProfile::new(100, 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LimitProfile {
    max_count: u32,
    window: Duration,
}

impl LimitProfile {
    const fn new(max_count: u32, window_secs: u64) -> Self {
        Self {
            max_count,
            window: Duration::from_secs(window_secs),
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Over the limit; `retry_after` is the time until the window resets.
    Limited { retry_after: Duration },
}

struct Window {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window rate limiter keyed by `(user, event class)`.
///
/// Windows are created lazily on first use and expire lazily: an expired
/// window is overwritten by the next check, so `purge_expired` is only
/// needed to keep memory bounded, never for correctness. Windows are keyed
/// by user rather than connection so reconnecting does not reset them.
pub struct RateLimiter {
    windows: Mutex<HashMap<(Uuid, EventKind), Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record one event and decide whether it may proceed.
    ///
    /// `actor` is `None` for connections that have not authenticated yet;
    /// those are never limited here (they can only authenticate, and get
    /// dropped on failure anyway).
    pub fn check_and_consume(&self, actor: Option<Uuid>, kind: EventKind) -> Verdict {
        self.check_and_consume_at(actor, kind, Instant::now())
    }

    pub fn check_and_consume_at(
        &self,
        actor: Option<Uuid>,
        kind: EventKind,
        now: Instant,
    ) -> Verdict {
        let Some(user_id) = actor else {
            return Verdict::Allowed;
        };

        let profile = kind.profile();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");

        let window = windows
            .entry((user_id, kind))
            .and_modify(|w| {
                if now >= w.reset_at {
                    w.count = 0;
                    w.reset_at = now + profile.window;
                }
            })
            .or_insert_with(|| Window {
                count: 0,
                reset_at: now + profile.window,
            });

        window.count += 1;
        if window.count <= profile.max_count {
            Verdict::Allowed
        } else {
            Verdict::Limited {
                retry_after: window.reset_at.saturating_duration_since(now),
            }
        }
    }

    /// Drop windows that expired more than `grace` ago. Run periodically
    /// from a background task.
    pub fn purge_expired(&self, grace: Duration) {
        self.purge_expired_at(grace, Instant::now());
    }

    pub fn purge_expired_at(&self, grace: Duration, now: Instant) {
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        windows.retain(|_, w| now < w.reset_at + grace);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..10 {
            assert_eq!(
                limiter.check_and_consume_at(Some(uid(1)), EventKind::RealmJoin, now),
                Verdict::Allowed
            );
        }

        match limiter.check_and_consume_at(Some(uid(1)), EventKind::RealmJoin, now) {
            Verdict::Limited { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            Verdict::Allowed => panic!("11th realm join should be limited"),
        }
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..11 {
            limiter.check_and_consume_at(Some(uid(1)), EventKind::RealmJoin, now);
        }
        let later = now + Duration::from_secs(61);
        assert_eq!(
            limiter.check_and_consume_at(Some(uid(1)), EventKind::RealmJoin, later),
            Verdict::Allowed
        );
    }

    #[test]
    fn retry_after_shrinks_as_the_window_ages() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..30 {
            limiter.check_and_consume_at(Some(uid(1)), EventKind::MessageSend, now);
        }
        let at_20s = now + Duration::from_secs(20);
        match limiter.check_and_consume_at(Some(uid(1)), EventKind::MessageSend, at_20s) {
            Verdict::Limited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(40));
            }
            Verdict::Allowed => panic!("should be limited"),
        }
    }

    #[test]
    fn users_and_kinds_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..11 {
            limiter.check_and_consume_at(Some(uid(1)), EventKind::RealmJoin, now);
        }

        // Other user, same kind.
        assert_eq!(
            limiter.check_and_consume_at(Some(uid(2)), EventKind::RealmJoin, now),
            Verdict::Allowed
        );
        // Same user, other kind.
        assert_eq!(
            limiter.check_and_consume_at(Some(uid(1)), EventKind::MessageSend, now),
            Verdict::Allowed
        );
    }

    #[test]
    fn unauthenticated_actors_are_never_limited() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..1000 {
            assert_eq!(
                limiter.check_and_consume_at(None, EventKind::Other, now),
                Verdict::Allowed
            );
        }
    }

    #[test]
    fn purge_drops_only_stale_windows() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        limiter.check_and_consume_at(Some(uid(1)), EventKind::MessageSend, now);
        limiter.check_and_consume_at(Some(uid(2)), EventKind::TypingSignal, now);
        assert_eq!(limiter.windows.lock().unwrap().len(), 2);

        // Both windows reset at now+60s; only beyond that plus the grace
        // are they purged.
        limiter.purge_expired_at(Duration::from_secs(120), now + Duration::from_secs(100));
        assert_eq!(limiter.windows.lock().unwrap().len(), 2);

        limiter.purge_expired_at(Duration::from_secs(120), now + Duration::from_secs(181));
        assert_eq!(limiter.windows.lock().unwrap().len(), 0);
    }

    #[test]
    fn command_classes() {
        assert_eq!(
            EventKind::of(&ClientCommand::Typing),
            EventKind::TypingSignal
        );
        assert_eq!(
            EventKind::of(&ClientCommand::JoinVoice {
                channel_id: uid(1)
            }),
            EventKind::Other
        );
        assert_eq!(
            EventKind::of(&ClientCommand::SendMessage {
                content: "hi".into(),
                thread_id: None,
                encrypted: false,
                encryption_metadata: None,
            }),
            EventKind::MessageSend
        );
    }
}
