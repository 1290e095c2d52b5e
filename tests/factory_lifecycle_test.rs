//! Handle factory lifecycle: singleton sharing, thread-bound handles,
//! client id sequencing and teardown.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use streampool::kafka::testing::{errors, MockDriverFactory};
use streampool::{FactoryConfig, ProducerFactory, SinkError};

fn shared_factory(mock: &Arc<MockDriverFactory>) -> ProducerFactory {
    let config = FactoryConfig::new("localhost:9092");
    ProducerFactory::with_driver_factory(config, mock.clone()).unwrap()
}

#[test]
fn test_shared_handle_is_a_singleton() {
    let mock = MockDriverFactory::manual();
    let factory = shared_factory(&mock);

    let first = factory.create_handle().unwrap();
    let second = factory.create_handle().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(mock.creation_count(), 1);
}

#[test]
fn test_handle_close_does_not_destroy_the_singleton() {
    let mock = MockDriverFactory::manual();
    let factory = shared_factory(&mock);

    let handle = factory.create_handle().unwrap();
    handle.close(Duration::from_secs(5));
    handle.close(Duration::from_secs(5));

    assert_eq!(mock.driver(0).close_count(), 0);
    let again = factory.create_handle().unwrap();
    assert!(Arc::ptr_eq(&handle, &again));
}

#[test]
fn test_concurrent_callers_build_one_singleton() {
    let mock = MockDriverFactory::manual();
    let factory = Arc::new(shared_factory(&mock));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let factory = factory.clone();
            thread::spawn(move || factory.create_handle().unwrap())
        })
        .collect();
    let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(mock.creation_count(), 1);
    for handle in &handles[1..] {
        assert!(Arc::ptr_eq(&handles[0], handle));
    }
}

#[test]
fn test_teardown_closes_singleton_and_is_idempotent() {
    let mock = MockDriverFactory::manual();
    let factory = shared_factory(&mock);

    factory.create_handle().unwrap();
    factory.teardown();
    factory.teardown();

    assert_eq!(mock.driver(0).close_count(), 1);
    assert_eq!(
        mock.driver(0).close_timeouts(),
        vec![Duration::from_secs(30)]
    );

    // the factory is usable again after teardown
    let fresh = factory.create_handle().unwrap();
    assert_eq!(mock.creation_count(), 2);
    fresh.close(Duration::from_secs(5));
    assert_eq!(mock.driver(1).close_count(), 0);
}

#[test]
fn test_thread_bound_handles_are_per_thread() {
    let mock = MockDriverFactory::manual();
    let config = FactoryConfig::new("localhost:9092").producer_per_thread(true);
    let factory = Arc::new(ProducerFactory::with_driver_factory(config, mock.clone()).unwrap());

    let local = factory.create_handle().unwrap();
    assert!(Arc::ptr_eq(&local, &factory.create_handle().unwrap()));

    let remote_factory = factory.clone();
    let remote = thread::spawn(move || remote_factory.create_handle().unwrap())
        .join()
        .unwrap();
    assert!(!Arc::ptr_eq(&local, &remote));
    assert_eq!(mock.creation_count(), 2);
}

#[test]
fn test_thread_bound_handles_survive_teardown() {
    let mock = MockDriverFactory::manual();
    let config = FactoryConfig::new("localhost:9092").producer_per_thread(true);
    let factory = ProducerFactory::with_driver_factory(config, mock.clone()).unwrap();

    factory.create_handle().unwrap();
    factory.teardown();
    assert_eq!(mock.driver(0).close_count(), 0);

    // the owning thread releases it explicitly
    factory.close_thread_bound_handle();
    assert_eq!(mock.driver(0).close_count(), 1);
    factory.close_thread_bound_handle();
    assert_eq!(mock.driver(0).close_count(), 1);
}

#[test]
fn test_client_ids_are_prefix_plus_sequence() {
    let mock = MockDriverFactory::manual();
    let config = FactoryConfig::new("localhost:9092")
        .client_id_prefix("svc")
        .transaction_id_prefix("tx-");
    let factory = ProducerFactory::with_driver_factory(config, mock.clone()).unwrap();

    // two concurrent checkouts force two distinct producers
    let _first = factory.create_handle().unwrap();
    let _second = factory.create_handle().unwrap();

    assert_eq!(mock.config(0).get("client.id"), Some("svc-1"));
    assert_eq!(mock.config(1).get("client.id"), Some("svc-2"));
    assert_eq!(mock.config(0).get("transactional.id"), Some("tx-0"));
    assert_eq!(mock.config(1).get("transactional.id"), Some("tx-1"));
}

#[test]
fn test_transactional_config_forces_idempotence() {
    let mock = MockDriverFactory::manual();
    let config = FactoryConfig::new("localhost:9092").transaction_id_prefix("tx-");
    let factory = ProducerFactory::with_driver_factory(config, mock.clone()).unwrap();

    factory.create_handle().unwrap();
    assert_eq!(mock.config(0).get("enable.idempotence"), Some("true"));
    assert_eq!(mock.config(0).get("bootstrap.servers"), Some("localhost:9092"));
}

#[test]
fn test_new_transactional_handle_initializes_once() {
    let mock = MockDriverFactory::manual();
    let config = FactoryConfig::new("localhost:9092").transaction_id_prefix("tx-");
    let factory = ProducerFactory::with_driver_factory(config, mock.clone()).unwrap();

    let handle = factory.create_handle().unwrap();
    assert_eq!(mock.driver(0).init_count(), 1);

    // reuse from the pool must not re-initialize
    handle.close(Duration::from_secs(5));
    factory.create_handle().unwrap();
    assert_eq!(mock.driver(0).init_count(), 1);
}

#[test]
fn test_init_failure_closes_the_raw_producer() {
    let mock = MockDriverFactory::manual();
    mock.fail_next_init(errors::generic());
    let config = FactoryConfig::new("localhost:9092").transaction_id_prefix("tx-");
    let factory = ProducerFactory::with_driver_factory(config, mock.clone()).unwrap();

    let result = factory.create_handle();
    assert!(matches!(result, Err(SinkError::Kafka(_))));
    assert_eq!(mock.driver(0).close_count(), 1);

    // the next request starts over with a fresh producer
    factory.create_handle().unwrap();
    assert_eq!(mock.creation_count(), 2);
}

#[test]
fn test_non_transactional_handle_is_detached() {
    let mock = MockDriverFactory::manual();
    let config = FactoryConfig::new("localhost:9092").transaction_id_prefix("tx-");
    let factory = ProducerFactory::with_driver_factory(config, mock.clone()).unwrap();

    let handle = factory.create_non_transactional_handle().unwrap();
    assert_eq!(mock.config(0).get("transactional.id"), None);

    handle.close(Duration::from_secs(5));
    assert_eq!(mock.driver(0).close_count(), 1);
}

#[test]
fn test_validation_rejects_empty_brokers() {
    let mock = MockDriverFactory::manual();
    let config = FactoryConfig::new("");
    assert!(matches!(
        ProducerFactory::with_driver_factory(config, mock),
        Err(SinkError::Configuration(_))
    ));
}
