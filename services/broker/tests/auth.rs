mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use broker::BrokerConfig;
use common::*;
use gmsg_client::{Error, Options};

fn single_user_config() -> BrokerConfig {
    BrokerConfig {
        user: Some("derek".to_string()),
        password: Some("foo".to_string()),
        ..BrokerConfig::local()
    }
}

fn with_port(server: &broker::ServerHandle, userinfo: &str) -> String {
    format!("gio://{userinfo}@{}", server.local_addr())
}

#[tokio::test(flavor = "multi_thread")]
async fn user_and_password_from_options() {
    let server = start_server(single_user_config()).await;
    let conn = options(&server)
        .user_info("derek", "foo")
        .connect()
        .await
        .expect("connect");
    assert!(conn.is_connected());
    assert!(conn.server_info().expect("info").auth_required);
    conn.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_password_fails_without_callbacks() {
    let server = start_server(single_user_config()).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let (d, c, r) = (Arc::clone(&fired), Arc::clone(&fired), Arc::clone(&fired));
    let err = options(&server)
        .user_info("derek", "bar")
        .allow_reconnect(true)
        .disconnected_callback(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .closed_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .reconnected_callback(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .connect()
        .await
        .expect_err("wrong password");
    assert!(matches!(err, Error::Authorization), "{err}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_credentials_are_refused() {
    let server = start_server(single_user_config()).await;
    let err = connect_err(options(&server)).await;
    assert!(matches!(err, Error::Authorization), "{err}");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn url_credentials_take_precedence() {
    let server = start_server(single_user_config()).await;

    let conn = Options::new()
        .url(with_port(&server, "derek:foo"))
        .user_info("derek", "wrong")
        .allow_reconnect(false)
        .connect()
        .await
        .expect("url credentials win");
    conn.close().await;

    let err = connect_err(
        Options::new()
            .url(with_port(&server, "derek:wrong"))
            .user_info("derek", "foo")
            .allow_reconnect(false),
    )
    .await;
    assert!(matches!(err, Error::Authorization), "{err}");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn token_authentication() {
    let config = BrokerConfig {
        token: Some("s3cr3t".to_string()),
        ..BrokerConfig::local()
    };
    let server = start_server(config).await;

    let via_url = Options::new()
        .url(with_port(&server, "s3cr3t"))
        .allow_reconnect(false)
        .connect()
        .await
        .expect("token in url");
    via_url.flush().await.expect("flush");

    let via_options = options(&server)
        .token("s3cr3t")
        .connect()
        .await
        .expect("token option");
    via_options.flush().await.expect("flush");

    let err = connect_err(options(&server).token("guess")).await;
    assert!(matches!(err, Error::Authorization), "{err}");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_client_hits_auth_timeout() {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let config = BrokerConfig {
        auth_timeout_ms: 100,
        ..single_user_config()
    };
    let server = start_server(config).await;
    let stream = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .expect("dial");
    let mut lines = BufReader::new(stream).lines();
    let info = lines.next_line().await.expect("read").expect("INFO line");
    assert!(info.starts_with("INFO "), "{info}");
    let err = tokio::time::timeout(WAIT, lines.next_line())
        .await
        .expect("server answers")
        .expect("read")
        .expect("-ERR line");
    assert_eq!(err, "-ERR 'Authentication Timeout'");
    let eof = tokio::time::timeout(WAIT, lines.next_line())
        .await
        .expect("server closes")
        .expect("read");
    assert!(eof.is_none());
    server.shutdown().await;
}

async fn connect_err(options: Options) -> Error {
    options.connect().await.expect_err("connect should fail")
}
