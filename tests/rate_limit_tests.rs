//! Rate limiter tests - fixed windows per caller identifier

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use persona_guard::caller::Caller;
use persona_guard::clock::ManualClock;
use persona_guard::config::RateLimitConfig;
use persona_guard::events::{GuardEvent, RecordingSink};
use persona_guard::failsafe::RateLimiter;

fn limiter(limit: u32) -> (RateLimiter, Arc<ManualClock>, Arc<RecordingSink>) {
    let clock = Arc::new(ManualClock::new());
    let sink = Arc::new(RecordingSink::new());
    let config = RateLimitConfig {
        enabled: true,
        window: Duration::from_secs(60),
        anonymous_limit: limit,
        authenticated_limit: limit,
        operation_limits: HashMap::new(),
    };
    (RateLimiter::with_parts(&config, clock.clone(), sink.clone()), clock, sink)
}

fn anonymous() -> Caller {
    Caller::Anonymous("203.0.113.9".parse().unwrap())
}

#[test]
fn test_fourth_call_in_window_is_denied() {
    // GIVEN: a limit of 3 per 60s window
    let (rl, clock, sink) = limiter(3);

    // WHEN: three calls are admitted and recorded
    let remaining: Vec<u32> = (0..3)
        .map(|_| {
            let decision = rl.check_and_record(&anonymous(), None);
            assert!(decision.allowed);
            decision.remaining
        })
        .collect();
    assert_eq!(remaining, vec![2, 1, 0]);

    // THEN: the fourth is denied with remaining 0 and a positive retry-after
    clock.advance(Duration::from_millis(20_500));
    let denied = rl.admit(&anonymous(), None);
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert_eq!(denied.retry_after_secs, 40);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        GuardEvent::RateLimited { identifier, limit: 3, retry_after_secs: 40, operation: None }
            if identifier == "ip:203.0.113.9"
    ));
}

#[test]
fn test_denials_do_not_consume_quota() {
    let (rl, clock, _) = limiter(1);
    assert!(rl.check_and_record(&anonymous(), None).allowed);
    for _ in 0..5 {
        assert!(!rl.check_and_record(&anonymous(), None).allowed);
    }
    clock.advance(Duration::from_secs(61));
    let fresh = rl.check_and_record(&anonymous(), None);
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 0);
}

#[test]
fn test_identifiers_have_independent_windows() {
    let (rl, _, _) = limiter(1);
    let alice = Caller::Authenticated("alice".to_string());
    let bob = Caller::Authenticated("bob".to_string());

    assert!(rl.check_and_record(&alice, None).allowed);
    assert!(!rl.check_and_record(&alice, None).allowed);
    assert!(rl.check_and_record(&bob, None).allowed);
    assert_eq!(rl.tracked(), 2);
}

#[test]
fn test_window_boundary_is_inclusive_of_duration() {
    // A window exactly `window` old is still current; one instant later it is gone
    let (rl, clock, _) = limiter(1);
    rl.check_and_record(&anonymous(), None);

    clock.advance(Duration::from_secs(60));
    let at_boundary = rl.admit(&anonymous(), None);
    assert!(!at_boundary.allowed);
    assert_eq!(at_boundary.retry_after_secs, 1, "retry-after never reports 0 on denial");

    clock.advance(Duration::from_millis(1));
    assert!(rl.admit(&anonymous(), None).allowed);
}
