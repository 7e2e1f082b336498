//! Registration, rendezvous, and deregistration behavior of the directory.

use std::sync::Arc;
use std::time::Duration;

use relay::directory::Directory;
use serde_json::{json, Value};
use tokio::time::timeout;
use wire::Connection;

const TICK: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(5);

fn connection_pair() -> (Arc<Connection>, Arc<Connection>) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    (
        Arc::new(Connection::new(left)),
        Arc::new(Connection::new(right)),
    )
}

/// Run the registration handshake for a fresh in-memory client.
///
/// Returns the client side of the stream and the server-side connection
/// the directory stored.
async fn register_client(
    directory: &Directory,
    id: &str,
    public_key: &str,
) -> (Arc<Connection>, Arc<Connection>) {
    let (client, server) = connection_pair();
    let payload = json!({
        "id": id,
        "first_name": "Ada",
        "last_name": "Lovelace",
        "public_key": public_key,
    });

    let registration = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.request(payload, 1, TICK).await })
    };
    let registered = timeout(WAIT, directory.register(Arc::clone(&server)))
        .await
        .expect("timeout")
        .expect("registration failed");
    assert_eq!(registered, id);

    let response = timeout(WAIT, registration)
        .await
        .expect("timeout")
        .unwrap()
        .expect("registration request failed");
    assert_eq!(response, Value::Null);

    (client, server)
}

#[tokio::test]
async fn lookup_after_registration_returns_the_installed_entry() {
    let directory = Directory::new();
    let (_client, server) = register_client(&directory, "C1", "key-C1").await;

    let info = timeout(WAIT, directory.info_by_id("C1"))
        .await
        .expect("timeout");
    assert_eq!(info.public_key, "key-C1");
    assert_eq!(info.first_name, "Ada");

    let connection = timeout(WAIT, directory.connection_by_id("C1"))
        .await
        .expect("timeout");
    assert!(Arc::ptr_eq(&connection, &server));
}

#[tokio::test]
async fn lookup_before_registration_suspends_until_it_happens() {
    let directory = Arc::new(Directory::new());

    let lookup = {
        let directory = Arc::clone(&directory);
        tokio::spawn(async move { directory.info_by_id("C2").await })
    };
    // No registration yet: the lookup must still be parked.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!lookup.is_finished());

    let (_client, _server) = register_client(&directory, "C2", "key-C2").await;

    let info = timeout(WAIT, lookup).await.expect("timeout").unwrap();
    assert_eq!(info.public_key, "key-C2");
}

#[tokio::test]
async fn deregister_is_idempotent_and_rearms_waiters() {
    let directory = Arc::new(Directory::new());
    let (_client, _server) = register_client(&directory, "C3", "key-old").await;

    directory.deregister("C3");
    directory.deregister("C3");

    // After deregistration a lookup suspends again.
    let lookup = {
        let directory = Arc::clone(&directory);
        tokio::spawn(async move { directory.info_by_id("C3").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!lookup.is_finished());

    let (_client, _server) = register_client(&directory, "C3", "key-new").await;
    let info = timeout(WAIT, lookup).await.expect("timeout").unwrap();
    assert_eq!(info.public_key, "key-new");
}

#[tokio::test]
async fn re_registration_replaces_the_previous_entry() {
    let directory = Directory::new();
    let (_first_client, first_server) = register_client(&directory, "C4", "key-first").await;
    let (_second_client, second_server) = register_client(&directory, "C4", "key-second").await;

    let connection = timeout(WAIT, directory.connection_by_id("C4"))
        .await
        .expect("timeout");
    assert!(Arc::ptr_eq(&connection, &second_server));
    assert!(!Arc::ptr_eq(&connection, &first_server));

    let info = timeout(WAIT, directory.info_by_id("C4"))
        .await
        .expect("timeout");
    assert_eq!(info.public_key, "key-second");
}

#[tokio::test]
async fn registration_wakes_every_parked_waiter() {
    let directory = Arc::new(Directory::new());

    let lookups: Vec<_> = (0..4)
        .map(|_| {
            let directory = Arc::clone(&directory);
            tokio::spawn(async move { directory.info_by_id("C5").await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_client, _server) = register_client(&directory, "C5", "key-C5").await;

    for lookup in lookups {
        let info = timeout(WAIT, lookup).await.expect("timeout").unwrap();
        assert_eq!(info.public_key, "key-C5");
    }
}
