mod support;

use std::{net::SocketAddr, time::Duration};

use destpool::{Client, DestinationKey, PoolStats, State};
use support::{
    mock::{MockTransport, SwitchResolver},
    settle,
};
use tokio::time::Instant;

const URL: &str = "http://fakehost:8080/";

fn key() -> DestinationKey {
    DestinationKey::new("fakehost", 8080)
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn timeout_then_address_change() {
    let _ = env_logger::try_init();

    let a = addr("10.0.0.1:0");
    let b = addr("10.0.0.2:0");
    let resolver = SwitchResolver::new(a);
    let transport = MockTransport::new().delay(a.ip(), Duration::from_millis(3000));
    let client = Client::builder()
        .max_connections_per_key(1)
        .timeout(Duration::from_millis(2000))
        .dns_resolver(resolver.clone())
        .build_with(transport.clone())
        .unwrap();

    // A answers slower than the deadline
    let start = Instant::now();
    let err = client.get(URL).send().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.url().map(|u| u.as_str()), Some(URL));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(2000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3000), "{elapsed:?}");

    assert_eq!(client.stats(&key()).await.unwrap(), PoolStats::default());
    assert_eq!(client.tracked_keys().await.unwrap(), 0);
    settle().await;
    assert_eq!(transport.live(), 0);

    // the destination moves to B; R2 opens a fresh connection and R3 waits
    resolver.answer(b);
    let r2 = client.get(URL).send();
    let r3 = client.get(URL).send();
    assert_eq!(client.queue_length(&key()).await.unwrap(), 1);
    assert_eq!(client.active_connection_count(&key()).await.unwrap(), 1);

    let (r2, r3) = tokio::join!(r2, r3);
    let (r2, r3) = (r2.unwrap(), r3.unwrap());

    let bound = addr("10.0.0.2:8080");
    assert_eq!(r2.remote_addr(), Some(bound));
    assert_eq!(r3.remote_addr(), Some(bound));
    assert_eq!(r2.connection_id(), r3.connection_id());
    assert_eq!(r2.headers()["x-served-by"], "10.0.0.2:8080");
    assert_eq!(r2.text(), "Hello!");
    assert_eq!(r3.text(), "Hello!");

    let stats = client.stats(&key()).await.unwrap();
    assert_eq!(stats.queue_length, 0);
    assert!(stats.active_connections <= 1);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(client.pending_requests().await.unwrap(), 0);

    assert_eq!(
        transport.opened(),
        vec![addr("10.0.0.1:8080"), addr("10.0.0.2:8080")]
    );
    assert_eq!(resolver.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn explicit_reset_of_running_exchange() {
    let _ = env_logger::try_init();

    let a = addr("10.0.0.1:0");
    let transport = MockTransport::new().delay(a.ip(), Duration::from_secs(5));
    let client = Client::builder()
        .max_connections_per_key(1)
        .dns_resolver(SwitchResolver::new(a))
        .build_with(transport.clone())
        .unwrap();

    let pending = client.get(URL).send();
    settle().await;
    assert_eq!(client.active_connection_count(&key()).await.unwrap(), 1);
    assert_eq!(transport.live(), 1);

    assert!(pending.reset().await);
    assert!(!pending.reset().await);
    assert!(pending.await.unwrap_err().is_reset());

    assert_eq!(client.stats(&key()).await.unwrap(), PoolStats::default());
    settle().await;
    assert_eq!(transport.live(), 0);
    assert!(transport.served_paths().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_after_completion_changes_nothing() {
    let _ = env_logger::try_init();

    let a = addr("10.0.0.1:0");
    let client = Client::builder()
        .dns_resolver(SwitchResolver::new(a))
        .build_with(MockTransport::new())
        .unwrap();

    let mut pending = client.get(URL).send();
    let res = (&mut pending).await.unwrap();
    assert_eq!(res.text(), "Hello!");

    let before = client.stats(&key()).await.unwrap();
    assert!(!pending.reset().await);
    assert_eq!(client.stats(&key()).await.unwrap(), before);
    assert_eq!(before.idle_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn reset_of_queued_request_keeps_order() {
    let _ = env_logger::try_init();

    let a = addr("10.0.0.1:0");
    let transport = MockTransport::new().delay(a.ip(), Duration::from_millis(500));
    let client = Client::builder()
        .max_connections_per_key(1)
        .dns_resolver(SwitchResolver::new(a))
        .build_with(transport.clone())
        .unwrap();

    let r1 = client.get("http://fakehost:8080/1").send();
    let r2 = client.get("http://fakehost:8080/2").send();
    let r3 = client.get("http://fakehost:8080/3").send();
    assert_eq!(client.queue_length(&key()).await.unwrap(), 2);

    assert!(r2.reset().await);
    assert_eq!(client.queue_length(&key()).await.unwrap(), 1);
    assert!(r2.await.unwrap_err().is_reset());

    let (r1, r3) = tokio::join!(r1, r3);
    assert_eq!(r1.unwrap().connection_id(), r3.unwrap().connection_id());
    assert_eq!(transport.served_paths(), vec!["/1", "/3"]);
    assert_eq!(transport.opened().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_pending_resets() {
    let _ = env_logger::try_init();

    let a = addr("10.0.0.1:0");
    let transport = MockTransport::new().delay(a.ip(), Duration::from_secs(5));
    let client = Client::builder()
        .dns_resolver(SwitchResolver::new(a))
        .build_with(transport.clone())
        .unwrap();

    let pending = client.get(URL).send();
    settle().await;
    assert_eq!(client.pending_requests().await.unwrap(), 1);

    drop(pending);
    assert_eq!(client.pending_requests().await.unwrap(), 0);
    assert_eq!(client.stats(&key()).await.unwrap(), PoolStats::default());
    settle().await;
    assert_eq!(transport.live(), 0);
}

/// Runs one slow request to completion of its deadline or its reset and
/// reports everything observable afterwards.
async fn cancel_at_one_second(by_timeout: bool) -> (PoolStats, usize, usize, usize, bool) {
    let a = addr("10.0.0.1:0");
    let transport = MockTransport::new().delay(a.ip(), Duration::from_secs(5));
    let mut builder = Client::builder()
        .max_connections_per_key(1)
        .dns_resolver(SwitchResolver::new(a));
    if by_timeout {
        builder = builder.timeout(Duration::from_secs(1));
    }
    let client = builder.build_with(transport.clone()).unwrap();

    let pending = client.get(URL).send();
    let err = if by_timeout {
        pending.await.unwrap_err()
    } else {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(pending.reset().await);
        pending.await.unwrap_err()
    };
    settle().await;

    (
        client.stats(&key()).await.unwrap(),
        client.tracked_keys().await.unwrap(),
        client.pending_requests().await.unwrap(),
        transport.live(),
        err.is_timeout() || err.is_reset(),
    )
}

#[tokio::test(start_paused = true)]
async fn timeout_releases_like_reset() {
    let _ = env_logger::try_init();

    let timed_out = cancel_at_one_second(true).await;
    let reset = cancel_at_one_second(false).await;
    assert_eq!(timed_out, reset);
    assert_eq!(timed_out, (PoolStats::default(), 0, 0, 0, true));
}

#[tokio::test(start_paused = true)]
async fn deadline_covers_time_spent_queued() {
    let _ = env_logger::try_init();

    let a = addr("10.0.0.1:0");
    let transport = MockTransport::new().delay(a.ip(), Duration::from_secs(5));
    let client = Client::builder()
        .max_connections_per_key(1)
        .dns_resolver(SwitchResolver::new(a))
        .build_with(transport.clone())
        .unwrap();

    let r1 = client.get(URL).send();
    let r2 = client.get(URL).timeout(Duration::from_secs(1)).send();
    let (id1, id2) = (r1.id().unwrap(), r2.id().unwrap());
    settle().await;
    assert_eq!(client.request_state(id1).await.unwrap(), Some(State::InFlight));
    assert_eq!(client.request_state(id2).await.unwrap(), Some(State::Queued));

    let err = r2.await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(client.request_state(id2).await.unwrap(), None);
    assert_eq!(
        client.stats(&key()).await.unwrap(),
        PoolStats {
            queue_length: 0,
            active_connections: 1,
            idle_connections: 0,
        }
    );

    assert!(r1.await.is_ok());
    assert_eq!(transport.opened().len(), 1);
}
