//! End-to-end tests against a real `TcpListener`, exercising the documented
//! request/response scenarios through [`tallyd::client::Client`] the same
//! way a real caller would, rather than poking the store types directly.
use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tallyd::auth::AuthStore;
use tallyd::cache::AggregationCache;
use tallyd::client::Client;
use tallyd::persistence::PersistenceStore;
use tallyd::protocol::{RequestBody, ResponsePayload, Status};
use tallyd::server::{self, AppState};
use tallyd::timeseries::TimeSeriesStore;
use tallyd::workerpool::WorkerPool;

fn start_server(data_dir: &std::path::Path, memory_days: usize, disk_days: usize) -> (Arc<AppState>, u16) {
    let persistence = Arc::new(PersistenceStore::new(data_dir.to_path_buf()));
    let auth = Arc::new(AuthStore::new());
    let cache = Arc::new(AggregationCache::new(memory_days));
    let ts = Arc::new(TimeSeriesStore::new(memory_days, disk_days, Arc::clone(&persistence), Arc::clone(&cache), 0, VecDeque::new()));
    let pool = Arc::new(WorkerPool::new(4));
    let state = Arc::new(AppState { auth, ts, cache, persistence, pool });

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let serve_state = Arc::clone(&state);
    thread::spawn(move || {
        let shutdown = Arc::new(AtomicBool::new(false));
        let _ = server::serve(listener, serve_state, shutdown);
    });
    // Give the accept loop a moment to start listening.
    thread::sleep(Duration::from_millis(30));
    (state, port)
}

fn connect(port: u16) -> Arc<Client> {
    Client::connect(("127.0.0.1", port)).unwrap()
}

fn register_and_login(client: &Client, username: &str, password: &str) {
    let resp = client.call(RequestBody::Register { username: username.into(), password: password.into() }).unwrap();
    assert_eq!(resp.status, Status::Ok);
    let resp = client.call(RequestBody::Login { username: username.into(), password: password.into() }).unwrap();
    assert_eq!(resp.status, Status::Ok);
}

#[test]
fn register_login_logout_and_auth_gate() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, port) = start_server(dir.path(), 7, 30);
    let client = connect(port);

    // Unauthenticated calls are rejected.
    let resp = client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 1, price: 1.0 }).unwrap();
    assert_eq!(resp.status, Status::NotAuthenticated);

    register_and_login(&client, "alice", "secret");

    // Re-registering the same user fails.
    let resp = client.call(RequestBody::Register { username: "alice".into(), password: "other".into() }).unwrap();
    assert_eq!(resp.status, Status::UserExists);

    // Wrong password fails auth.
    let resp = client.call(RequestBody::Login { username: "alice".into(), password: "wrong".into() }).unwrap();
    assert_eq!(resp.status, Status::AuthFailed);

    // Logout revokes the authenticated session on this connection.
    let resp = client.call(RequestBody::Logout).unwrap();
    assert_eq!(resp.status, Status::Ok);
    let resp = client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 1, price: 1.0 }).unwrap();
    assert_eq!(resp.status, Status::NotAuthenticated);
}

#[test]
fn window_aggregation_matches_documented_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, port) = start_server(dir.path(), 7, 30);
    let client = connect(port);
    register_and_login(&client, "alice", "secret");

    client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 2, price: 1.00 }).unwrap();
    client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 3, price: 2.00 }).unwrap();
    client.call(RequestBody::NewDay).unwrap();
    client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 1, price: 5.00 }).unwrap();
    client.call(RequestBody::NewDay).unwrap();

    let resp = client.call(RequestBody::QuantitySold { product: "apple".into(), days: 2 }).unwrap();
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.payload, ResponsePayload::Quantity { quantity: 6 });

    let resp = client.call(RequestBody::SalesVolume { product: "apple".into(), days: 2 }).unwrap();
    match resp.payload {
        ResponsePayload::Revenue { revenue } => assert!((revenue - 13.00).abs() < 1e-9),
        other => panic!("unexpected payload: {other:?}"),
    }

    let resp = client.call(RequestBody::MaxPrice { product: "apple".into(), days: 2 }).unwrap();
    assert_eq!(resp.payload, ResponsePayload::MaxPrice { max_price: 5.00 });
}

#[test]
fn insufficient_historical_data_is_reported_as_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, port) = start_server(dir.path(), 7, 30);
    let client = connect(port);
    register_and_login(&client, "alice", "secret");

    client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 1, price: 1.0 }).unwrap();
    client.call(RequestBody::NewDay).unwrap();

    let resp = client.call(RequestBody::QuantitySold { product: "apple".into(), days: 5 }).unwrap();
    assert_eq!(resp.status, Status::Error);
    assert!(matches!(resp.payload, ResponsePayload::Error { .. }));
}

#[test]
fn simultaneous_sales_blocks_until_both_products_sold() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, port) = start_server(dir.path(), 7, 30);
    let client = connect(port);
    register_and_login(&client, "alice", "secret");

    let waiter_client = Arc::clone(&client);
    let waiter = thread::spawn(move || {
        waiter_client
            .call(RequestBody::SimultaneousSales { product1: "apple".into(), product2: "banana".into() })
            .unwrap()
    });

    thread::sleep(Duration::from_millis(40));
    client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 1, price: 1.0 }).unwrap();
    thread::sleep(Duration::from_millis(40));
    client.call(RequestBody::AddEvent { product: "banana".into(), quantity: 1, price: 1.0 }).unwrap();

    let resp = waiter.join().unwrap();
    assert_eq!(resp.payload, ResponsePayload::Bool { result: true });
}

#[test]
fn consecutive_sales_blocks_until_n_in_a_row() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, port) = start_server(dir.path(), 7, 30);
    let client = connect(port);
    register_and_login(&client, "alice", "secret");

    let waiter_client = Arc::clone(&client);
    let waiter = thread::spawn(move || waiter_client.call(RequestBody::ConsecutiveSales { n: 3 }).unwrap());

    for product in ["a", "a", "b", "a", "a", "a"] {
        thread::sleep(Duration::from_millis(15));
        client.call(RequestBody::AddEvent { product: product.into(), quantity: 1, price: 1.0 }).unwrap();
    }

    let resp = waiter.join().unwrap();
    assert_eq!(resp.payload, ResponsePayload::Product { product: "a".into() });
}

#[test]
fn demultiplexer_runs_a_blocking_and_nonblocking_call_concurrently_on_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, port) = start_server(dir.path(), 7, 30);
    let client = connect(port);
    register_and_login(&client, "alice", "secret");

    // The blocking call is issued first and must not stall the connection:
    // the AddEvent call below has to reach the server and be serviced while
    // the consecutive-sales wait is still parked.
    let waiter_client = Arc::clone(&client);
    let waiter = thread::spawn(move || waiter_client.call(RequestBody::ConsecutiveSales { n: 1 }).unwrap());

    thread::sleep(Duration::from_millis(30));
    let resp = client.call(RequestBody::QuantitySold { product: "apple".into(), days: 0 }).unwrap();
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.payload, ResponsePayload::Quantity { quantity: 0 });

    client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 1, price: 1.0 }).unwrap();
    let resp = waiter.join().unwrap();
    assert_eq!(resp.payload, ResponsePayload::Product { product: "apple".into() });
}

#[test]
fn persisted_day_data_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (state, port) = start_server(dir.path(), 7, 30);
        let client = connect(port);
        register_and_login(&client, "alice", "secret");
        client.call(RequestBody::AddEvent { product: "apple".into(), quantity: 4, price: 2.0 }).unwrap();
        client.call(RequestBody::NewDay).unwrap();
        state.save().unwrap();
    }

    // Simulate the startup recovery protocol directly against the same
    // data directory: load state, then the completed day files it names.
    let persistence = PersistenceStore::new(dir.path().to_path_buf());
    let current_day_id = persistence.load_state().unwrap().unwrap();
    assert_eq!(current_day_id, 1);
    let events = persistence.load_day(0).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].product, "apple");
    assert_eq!(events[0].quantity, 4);

    let users = persistence.load_users().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].username, "alice");
}
