mod support;

use std::time::Duration;

use destpool::{Client, DestinationKey, PoolStats};
use support::server;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[tokio::test]
async fn response_text_over_pooled_connection() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async { http::Response::new("Hello!".into()) });

    let client = Client::builder()
        .resolve("fakehost", server.addr())
        .build()
        .unwrap();
    let url = format!("http://fakehost:{}/text", server.addr().port());

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), destpool::StatusCode::OK);
    assert_eq!(first.remote_addr(), Some(server.addr()));
    assert_eq!(first.url().as_str(), url);
    let connection = first.connection_id();
    assert_eq!(first.text(), "Hello!");

    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.connection_id(), connection);

    let key = DestinationKey::new("fakehost", server.addr().port());
    let stats = client.stats(&key).await.unwrap();
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.active_connections, 0);
}

#[tokio::test]
async fn host_header_and_body_are_sent() {
    let _ = env_logger::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "POST");
        assert_eq!(req.uri(), "/echo?x=1");
        let host = req.headers()["host"].to_str().unwrap().to_owned();
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        http::Response::builder()
            .header("x-host", host)
            .body(body.into())
            .unwrap()
    });

    let client = Client::builder()
        .resolve("fakehost", server.addr())
        .build()
        .unwrap();
    let port = server.addr().port();

    let res = client
        .post(format!("http://fakehost:{port}/echo?x=1"))
        .header("x-test", "yes")
        .body("ping")
        .send()
        .await
        .unwrap();

    assert_eq!(res.headers()["x-host"], format!("fakehost:{port}").as_str());
    assert_eq!(res.bytes(), "ping");
}

#[tokio::test]
async fn timeout_closes_the_connection() {
    let _ = env_logger::try_init();

    let mut server = server::http(move |_req| async {
        // delay returning the response
        tokio::time::sleep(Duration::from_millis(300)).await;
        http::Response::default()
    });

    let client = Client::builder()
        .timeout(Duration::from_millis(100))
        .resolve("fakehost", server.addr())
        .build()
        .unwrap();
    let url = format!("http://fakehost:{}/slow", server.addr().port());

    let err = client.get(&url).send().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.url().map(|u| u.as_str()), Some(url.as_str()));

    let key = DestinationKey::new("fakehost", server.addr().port());
    assert_eq!(client.active_connection_count(&key).await.unwrap(), 0);
    assert!(server.closed_connection().await);
}

#[tokio::test]
async fn error_for_status() {
    let _ = env_logger::try_init();

    let server = server::http(move |_req| async {
        http::Response::builder()
            .status(500)
            .body(Default::default())
            .unwrap()
    });

    let client = Client::builder()
        .resolve("fakehost", server.addr())
        .build()
        .unwrap();
    let url = format!("http://fakehost:{}/err", server.addr().port());

    let res = client.get(&url).send().await.unwrap();
    let err = res.error_for_status().unwrap_err();
    assert!(err.is_status());
    assert_eq!(err.status(), Some(destpool::StatusCode::INTERNAL_SERVER_ERROR));
}

#[tokio::test]
async fn connection_close_response_completes() {
    let _ = env_logger::try_init();

    let mut server = server::http(move |_req| async {
        http::Response::builder()
            .header("connection", "close")
            .body("Hello!".into())
            .unwrap()
    });

    let client = Client::builder()
        .resolve("fakehost", server.addr())
        .build()
        .unwrap();
    let url = format!("http://fakehost:{}/close", server.addr().port());

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), destpool::StatusCode::OK);
    let connection = first.connection_id();
    assert_eq!(first.text(), "Hello!");
    assert!(server.closed_connection().await);

    let key = DestinationKey::new("fakehost", server.addr().port());
    assert_eq!(client.stats(&key).await.unwrap(), PoolStats::default());

    let second = client.get(&url).send().await.unwrap();
    assert_ne!(second.connection_id(), connection);
    assert_eq!(second.text(), "Hello!");
}

#[tokio::test]
async fn idle_connection_closed_by_server_is_dropped() {
    let _ = env_logger::try_init();

    // answers one keep-alive request per connection, then hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0; 1024];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 6\r\n\r\nHello!")
                    .await;
            });
        }
    });

    let client = Client::builder().resolve("fakehost", addr).build().unwrap();
    let url = format!("http://fakehost:{}/", addr.port());
    let key = DestinationKey::new("fakehost", addr.port());

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.text(), "Hello!");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.stats(&key).await.unwrap(), PoolStats::default());

    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.text(), "Hello!");
}
