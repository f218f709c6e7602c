mod common;

use common::{MockCluster, BASE_PORT};
use kv_client_core::{Client, ClientError, Key, Policy};
use std::sync::{Arc, Barrier};
use std::thread;

const USER: &str = "admin";
const PASSWORD: &str = "secret";

fn secured_config(mock: &MockCluster, password: &str) -> kv_client_core::ClientConfig {
    let mut config = mock.config();
    config.cluster.user = Some(USER.to_string());
    config.cluster.password = Some(password.to_string());
    config
}

fn secured(nodes: usize) -> (Arc<MockCluster>, Client) {
    let mock = MockCluster::with_nodes(nodes);
    mock.enable_security(USER, PASSWORD);
    let client = Client::with_connectors(secured_config(&mock, PASSWORD), mock.connectors()).unwrap();
    (mock, client)
}

fn no_retry() -> Policy {
    Policy {
        max_retries: 0,
        sleep_between_retries_ms: 0,
        ..Policy::default()
    }
}

#[test]
fn test_login_issues_session_per_node() {
    let (mock, client) = secured(2);

    let a = client.cluster().get_node("A").unwrap().session().expect("session for A");
    let b = client.cluster().get_node("B").unwrap().session().expect("session for B");
    assert!(!a.token.is_empty());
    assert!(!b.token.is_empty());
    assert_ne!(a.token, b.token);
    assert!(mock.logins() >= 2);
}

#[test]
fn test_new_connections_authenticate_with_session() {
    let (mock, client) = secured(1);
    let key = Key::new("test", "users", "auth");
    mock.put_record(&key, &[("v", 7)]);

    let record = client.get(None, &key, None).unwrap().unwrap();
    assert_eq!(record.generation, 1);
    assert!(mock.authentications() >= 1);
}

#[test]
fn test_wrong_password_fails_client_creation() {
    let mock = MockCluster::with_nodes(1);
    mock.enable_security(USER, PASSWORD);

    let result = Client::with_connectors(secured_config(&mock, "wrong"), mock.connectors());
    assert!(result.is_err());
    assert_eq!(mock.logins(), 0);
}

#[test]
fn test_rejected_session_logs_in_again_on_tend() {
    let (mock, client) = secured(1);
    let node = client.cluster().get_node("A").unwrap();
    let old_token = node.session().unwrap().token.clone();
    let logins = mock.logins();
    let key = Key::new("test", "users", "relogin");

    mock.expire_sessions();
    let err = client.get(Some(&no_retry()), &key, None).unwrap_err();
    assert!(matches!(err.root(), ClientError::Authentication(_)));

    client.cluster().tend();

    assert!(!node.login_requested());
    assert_eq!(mock.logins(), logins + 1);
    assert_ne!(node.session().unwrap().token, old_token);
    assert!(client.get(None, &key, None).unwrap().is_none());
    assert!(mock.authentications() >= 1);
}

#[test]
fn test_concurrent_login_signals_claim_once() {
    let (mock, client) = secured(1);
    let node = client.cluster().get_node("A").unwrap();

    // Logins fail until the password is restored, so the request stays pending.
    mock.enable_security(USER, "rotated");
    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let node = node.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                node.signal_login()
            })
        })
        .collect();
    let claimed = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|claimed| *claimed)
        .count();

    assert_eq!(claimed, 1);
    assert!(node.login_requested());

    mock.enable_security(USER, PASSWORD);
    client.cluster().tend();
    client.cluster().tend();

    assert!(!node.login_requested());
    assert_eq!(mock.logins(), 1);
    assert!(node.signal_login());
}

#[test]
fn test_security_disabled_keeps_empty_session() {
    let mock = MockCluster::with_nodes(1);
    let client = Client::with_connectors(secured_config(&mock, PASSWORD), mock.connectors()).unwrap();
    let key = Key::new("test", "users", "open");

    assert!(client.cluster().get_node("A").unwrap().session().is_none());
    assert!(client.get(None, &key, None).unwrap().is_none());
    assert_eq!(mock.logins(), 0);
    assert!(client.cluster().get_node("A").unwrap().is_active());
    assert_eq!(client.cluster().get_node("A").unwrap().host().port, BASE_PORT);
}
