//! Tests for utility functions

use chrono::{Duration, Utc};

use lab_allocator::util::{
    format_stamp, generate_alloc_id, guest_key, is_valid_alloc_id, is_valid_identifier,
    parse_stamp, EPOCH_STAMP,
};

#[test]
fn test_alloc_ids_are_distinct() {
    let a = generate_alloc_id();
    let b = generate_alloc_id();
    assert!(is_valid_alloc_id(&a));
    assert!(is_valid_alloc_id(&b));
    assert_ne!(a, b);
}

#[test]
fn test_stamps_sort_in_time_order() {
    let now = Utc::now();
    let earlier = format_stamp(now - Duration::seconds(5));
    let later = format_stamp(now);
    assert!(earlier < later);
    assert!(EPOCH_STAMP < earlier.as_str());
}

#[test]
fn test_stamp_round_trip_drops_subseconds() {
    let now = Utc::now();
    let parsed = parse_stamp(&format_stamp(now)).unwrap();
    assert!(now.signed_duration_since(parsed) < Duration::seconds(1));
}

#[test]
fn test_identifiers_and_guest_keys() {
    assert!(is_valid_identifier("qa-bot@lab"));
    assert!(!is_valid_identifier("qa bot"));
    assert_eq!(guest_key("qa-bot@lab").len(), 8);
}
