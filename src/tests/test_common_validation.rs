use crate::{AbuseThreshold, BucketParams, Capacity, RateLimitDecision, RefillRate, RejectionReason};

#[test]
fn refill_rate_try_from_validates_positive() {
    let r = RefillRate::try_from(0.5f64).unwrap();
    assert_eq!(*r, 0.5f64);

    for invalid in [0f64, -1f64, f64::NAN, f64::INFINITY] {
        assert_eq!(
            RefillRate::try_from(invalid).unwrap_err(),
            "Refill rate must be greater than 0"
        );
    }
}

#[test]
fn capacity_try_from_validates_positive() {
    let c = Capacity::try_from(10f64).unwrap();
    assert_eq!(*c, 10f64);

    for invalid in [0f64, -5f64, f64::NAN] {
        assert_eq!(
            Capacity::try_from(invalid).unwrap_err(),
            "Capacity must be greater than 0"
        );
    }
}

#[test]
fn abuse_threshold_try_from_validates_min_1() {
    let t = AbuseThreshold::try_from(1u64).unwrap();
    assert_eq!(*t, 1u64);

    assert_eq!(
        AbuseThreshold::try_from(0u64).unwrap_err(),
        "Abuse threshold must be at least 1"
    );
}

#[test]
fn bucket_params_prefix_keys_only_when_set() {
    let mut params = BucketParams::new(
        RefillRate::try_from(1f64).unwrap(),
        Capacity::try_from(1f64).unwrap(),
    );
    assert_eq!(params.prefixed_key("user"), "user");

    params.key_prefix = "login".to_string();
    assert_eq!(params.prefixed_key("user"), "login:user");
}

#[test]
fn bucket_params_full_refill_ms() {
    let params = BucketParams::new(
        RefillRate::try_from(2f64).unwrap(),
        Capacity::try_from(5f64).unwrap(),
    );
    assert_eq!(params.full_refill_ms(), 2500);

    let params = BucketParams::new(
        RefillRate::try_from(0.1f64).unwrap(),
        Capacity::try_from(1f64).unwrap(),
    );
    assert_eq!(params.full_refill_ms(), 10_000);
}

#[test]
fn rejected_decision_reports_zero_tokens() {
    let allowed = RateLimitDecision::Allowed {
        remaining_tokens: 2.5,
    };
    assert!(allowed.is_allowed());
    assert_eq!(allowed.remaining_tokens(), 2.5);

    let rejected = RateLimitDecision::Rejected {
        reason: RejectionReason::LockedOut,
    };
    assert!(!rejected.is_allowed());
    assert_eq!(rejected.remaining_tokens(), 0f64);
}
