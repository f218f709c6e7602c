mod common;

use common::{Fault, MockCluster, BASE_PORT, SERVER_TIMEOUT};
use kv_client_core::result_code;
use kv_client_core::task::ServerTask;
use kv_client_core::{Bin, Client, ClientError, Key, Particle, Policy, WritePolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn connect(mock: &Arc<MockCluster>) -> Client {
    Client::with_connectors(mock.config(), mock.connectors()).unwrap()
}

fn retry_policy(max_retries: u32) -> Policy {
    Policy {
        max_retries,
        sleep_between_retries_ms: 0,
        ..Policy::default()
    }
}

#[test]
fn test_put_get_exists_delete() {
    let mock = MockCluster::with_nodes(2);
    let client = connect(&mock);
    let key = Key::new("test", "users", "alice");

    assert!(client.get(None, &key, None).unwrap().is_none());
    assert!(!client.exists(None, &key).unwrap());

    let bins = vec![
        Bin::new("name", Particle::string("alice")),
        Bin::new("age", Particle::integer(30)),
    ];
    client.put(None, &key, &bins).unwrap();
    assert!(mock.has_record(&key));

    let record = client.get(None, &key, None).unwrap().unwrap();
    assert_eq!(&record.get("name").unwrap().data[..], b"alice");
    assert_eq!(record.generation, 1);

    let partial = client.get(None, &key, Some(&["age"])).unwrap().unwrap();
    assert!(partial.get("name").is_none());
    assert_eq!(&partial.get("age").unwrap().data[..], &30i64.to_be_bytes());

    let header = client.get_header(None, &key).unwrap().unwrap();
    assert!(header.bins.is_empty());
    assert_eq!(header.generation, 1);

    assert!(client.exists(None, &key).unwrap());
    assert!(client.delete(None, &key).unwrap());
    assert!(!client.delete(None, &key).unwrap());
}

#[test]
fn test_generation_mismatch_is_not_retried() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "gen");
    client.put(None, &key, &[Bin::new("v", Particle::integer(1))]).unwrap();

    let policy = WritePolicy {
        generation: 99,
        base: retry_policy(3),
        ..WritePolicy::default()
    };
    let before = mock.data_requests();
    let err = client.put(Some(&policy), &key, &[]).unwrap_err();

    assert_eq!(err.result_code(), result_code::GENERATION_ERROR);
    assert_eq!(mock.data_requests() - before, 1);
    assert_eq!(err.iteration(), Some(1));
    // The stream stayed in sync, so the connection went back to the pool.
    assert_eq!(client.stats().total_sync().in_pool, 1);
}

#[test]
fn test_network_errors_use_whole_retry_budget() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "flaky");
    for _ in 0..3 {
        mock.push_fault(Fault::Reset);
    }

    let err = client.get(Some(&retry_policy(2)), &key, None).unwrap_err();

    assert_eq!(mock.data_requests(), 3);
    assert_eq!(err.iteration(), Some(3));
    assert!(err.is_network());
    assert!(!err.in_doubt());
    assert!(err.node().is_some());
}

#[test]
fn test_retry_recovers_after_reset() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "recover");
    mock.put_record(&key, &[("v", 5)]);
    mock.push_fault(Fault::Reset);

    let record = client.get(Some(&retry_policy(2)), &key, None).unwrap().unwrap();
    assert_eq!(&record.get("v").unwrap().data[..], &5i64.to_be_bytes());
    assert_eq!(mock.data_requests(), 2);
}

#[test]
fn test_server_timeout_is_retried() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "slow");
    mock.put_record(&key, &[("v", 1)]);
    mock.push_fault(Fault::Code(SERVER_TIMEOUT));

    assert!(client.exists(Some(&retry_policy(1)), &key).unwrap());
    assert_eq!(mock.data_requests(), 2);
}

#[test]
fn test_server_timeouts_exhaust_to_timeout_error() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "slow");
    for _ in 0..2 {
        mock.push_fault(Fault::Code(SERVER_TIMEOUT));
    }

    let err = client.get(Some(&retry_policy(1)), &key, None).unwrap_err();
    assert!(matches!(err.root(), ClientError::Timeout { client: false, .. }));
    assert_eq!(err.result_code(), result_code::TIMEOUT);
}

#[test]
fn test_write_sent_before_failure_is_in_doubt() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "doubt");
    mock.push_fault(Fault::Reset);

    let err = client
        .put(None, &key, &[Bin::new("v", Particle::integer(1))])
        .unwrap_err();
    assert!(err.in_doubt());
    assert_eq!(err.iteration(), Some(1));
}

#[test]
fn test_write_never_sent_is_not_in_doubt() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "unsent");
    mock.set_down(BASE_PORT, true);

    let err = client
        .put(None, &key, &[Bin::new("v", Particle::integer(1))])
        .unwrap_err();
    assert!(!err.in_doubt());
    assert_eq!(mock.data_requests(), 0);
}

#[test]
fn test_total_timeout_bounds_retries() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "hang");
    for _ in 0..20 {
        mock.push_fault(Fault::Hang);
    }
    let policy = Policy {
        socket_timeout_ms: 40,
        total_timeout_ms: 100,
        max_retries: 20,
        sleep_between_retries_ms: 0,
        ..Policy::default()
    };

    let started = Instant::now();
    let err = client.get(Some(&policy), &key, None).unwrap_err();

    assert!(matches!(err.root(), ClientError::Timeout { client: true, .. }));
    assert!(mock.data_requests() < 20);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_deadline_during_network_retries_is_client_timeout() {
    let mock = MockCluster::with_nodes(1);
    let client = connect(&mock);
    let key = Key::new("test", "users", "reset");
    for _ in 0..20 {
        mock.push_fault(Fault::Reset);
    }
    let policy = Policy {
        total_timeout_ms: 100,
        max_retries: 100,
        sleep_between_retries_ms: 30,
        ..Policy::default()
    };

    let err = client.get(Some(&policy), &key, None).unwrap_err();

    assert!(matches!(err.root(), ClientError::Timeout { client: true, .. }));
    assert!(mock.data_requests() < 20);
}

#[test]
fn test_pool_exhaustion_and_release() {
    let mock = MockCluster::with_nodes(1);
    let mut config = mock.config();
    config.cluster.max_conns_per_node = 1;
    let client = Client::with_connectors(config, mock.connectors()).unwrap();
    let node = client.cluster().get_node("A").unwrap();
    let key = Key::new("test", "users", "pool");

    let lease = node.get_connection(Some(Duration::from_millis(100))).unwrap();
    let second = node.get_connection(Some(Duration::from_millis(100)));
    assert!(matches!(second, Err(ClientError::NoMoreConnections { max: 1, .. })));

    let err = client.get(Some(&retry_policy(0)), &key, None).unwrap_err();
    assert!(matches!(err.root(), ClientError::NoMoreConnections { .. }));

    lease.put_back();
    let stats = node.connection_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.in_pool, 1);

    assert!(client.get(None, &key, None).unwrap().is_none());
    let stats = node.connection_stats();
    assert!(stats.in_use + stats.in_pool <= 1);
}

#[test]
fn test_info_task_waits_for_every_node() {
    let mock = MockCluster::with_nodes(2);
    let client = connect(&mock);
    mock.set_info(BASE_PORT, "sindex/test/idx", "RW");
    mock.set_info(BASE_PORT + 1, "sindex/test/idx", "WO");

    let task = client.info_task("sindex/test/idx", |value| value == "RW");
    assert!(!task.is_done().unwrap());

    mock.set_info(BASE_PORT + 1, "sindex/test/idx", "RW");
    task.wait_with_interval(Duration::from_millis(10)).unwrap();
    assert!(task.is_done().unwrap());
}
