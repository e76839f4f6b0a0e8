//! Tests for the reference-counted log store.

use super::*;
use crate::store::log::LogEvent;
use std::sync::Mutex as StdMutex;

const SEED: [u8; 32] = [42; 32];

#[test]
fn test_get_is_idempotent_per_key() {
    let store = LogStore::new(SEED, 4);
    let a = store.get(&LogSpec::named("prices")).unwrap();
    let b = store.get(&LogSpec::named("prices")).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let by_key = store.get(&LogSpec::key(a.key())).unwrap();
    assert!(Arc::ptr_eq(&a, &by_key));
    assert_eq!(store.open_count(), 1);
}

#[test]
fn test_named_logs_are_writable_and_foreign_keys_are_not() {
    let store = LogStore::new(SEED, 4);
    let named = store.get(&LogSpec::named("mine")).unwrap();
    assert!(named.writable());

    let foreign = store.get(&LogSpec::key(LogKey([9; 32]))).unwrap();
    assert!(!foreign.writable());
}

#[test]
fn test_get_validates_log_spec() {
    let store = LogStore::new(SEED, 4);
    assert!(matches!(
        store.get(&LogSpec::default()),
        Err(HubError::InvalidArgument { .. })
    ));
    assert!(matches!(
        store.get(&LogSpec::named("")),
        Err(HubError::InvalidArgument { .. })
    ));
    let mismatched = LogSpec {
        key: Some(LogKey([1; 32])),
        name: Some("prices".to_string()),
    };
    assert!(store.get(&mismatched).is_err());
}

#[test]
fn test_last_strong_reference_evicts_and_notifies() {
    let store = LogStore::new(SEED, 0);
    let log = store.get(&LogSpec::named("prices")).unwrap();
    log.append(vec![b"abc".to_vec()]).unwrap();
    let dk = log.discovery_key();
    let events = Arc::new(StdMutex::new(Vec::new()));
    let sink = events.clone();
    log.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

    store.increment(&dk);
    store.increment(&dk);
    store.decrement(&dk);
    assert!(!log.is_closed());
    assert_eq!(store.strong_count(&dk), 1);

    store.decrement(&dk);
    assert!(log.is_closed());
    assert_eq!(*events.lock().unwrap(), vec![LogEvent::Close]);
    assert!(store.find(&dk).is_none());

    let reopened = store.get(&LogSpec::named("prices")).unwrap();
    assert!(!Arc::ptr_eq(&log, &reopened));
    assert_eq!(reopened.length(), 1);
    assert_eq!(reopened.byte_length(), 3);
    assert!(reopened.writable());
}

#[test]
fn test_idle_logs_are_kept_up_to_limit() {
    let store = LogStore::new(SEED, 1);
    let a = store.get(&LogSpec::named("a")).unwrap();
    let b = store.get(&LogSpec::named("b")).unwrap();
    store.increment(&a.discovery_key());
    store.increment(&b.discovery_key());

    store.decrement(&a.discovery_key());
    assert!(!a.is_closed());
    store.decrement(&b.discovery_key());
    assert!(a.is_closed());
    assert!(!b.is_closed());
}

#[test]
fn test_extra_decrement_is_ignored() {
    let store = LogStore::new(SEED, 0);
    let log = store.get(&LogSpec::named("a")).unwrap();
    let other = store.get(&LogSpec::named("b")).unwrap();
    store.increment(&other.discovery_key());
    store.increment(&log.discovery_key());
    store.decrement(&other.discovery_key());
    store.decrement(&other.discovery_key());
    assert!(!log.is_closed());
}

#[test]
fn test_feed_listeners_see_new_logs_once() {
    let store = LogStore::new(SEED, 4);
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = seen.clone();
    let id = store.subscribe_feeds(move |log| sink.lock().unwrap().push(log.key()));

    let a = store.get(&LogSpec::named("a")).unwrap();
    store.get(&LogSpec::named("a")).unwrap();
    store.unsubscribe_feeds(id);
    store.get(&LogSpec::named("b")).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![a.key()]);
}
