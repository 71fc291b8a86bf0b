mod common;

use std::time::Duration;

use broker::BrokerConfig;
use common::*;
use gmsg_client::{Connection, Error};
use tokio::sync::mpsc;

const QUIET: Duration = Duration::from_millis(200);

async fn users_server() -> broker::ServerHandle {
    let config = BrokerConfig {
        users: vec![
            user("ivan", "pwd", Some(vec!["foo"]), Some(vec!["bar"])),
            user("derek", "pass", Some(vec![]), Some(vec![])),
            gmsg_authz::User::new("admin", "admin"),
        ],
        ..BrokerConfig::local()
    };
    start_server(config).await
}

async fn connect_as(
    server: &broker::ServerHandle,
    name: &str,
    password: &str,
) -> (Connection, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = options(server)
        .user_info(name, password)
        .error_callback(move |_, err| {
            let _ = tx.send(err.to_string());
        })
        .connect()
        .await
        .expect("connect");
    (conn, rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_violation_is_async_and_keeps_link() {
    let server = users_server().await;
    let (ivan, mut errors) = connect_as(&server, "ivan", "pwd").await;

    ivan.publish("bar", "nope").await.expect("queued");
    let reported = next_event(&mut errors).await;
    assert!(reported.contains("publish"), "{reported}");
    assert!(reported.contains("\"bar\""), "{reported}");
    assert!(!reported.contains("subscription"), "{reported}");

    ivan.flush().await.expect("link still up");
    assert!(ivan.is_connected());
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_violation_is_async_and_keeps_link() {
    let server = users_server().await;
    let (ivan, mut errors) = connect_as(&server, "ivan", "pwd").await;

    let _denied = ivan.subscribe_sync("foo").await.expect("queued");
    let reported = next_event(&mut errors).await;
    assert!(reported.contains("subscription"), "{reported}");
    assert!(reported.contains("\"foo\""), "{reported}");

    ivan.flush().await.expect("link still up");
    assert!(ivan.is_connected());
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn allowed_traffic_flows_next_to_violations() {
    let server = users_server().await;
    let (ivan, mut errors) = connect_as(&server, "ivan", "pwd").await;
    let (admin, _) = connect_as(&server, "admin", "admin").await;

    let inbound = ivan.subscribe_sync("bar").await.expect("sub bar");
    let outbound = admin.subscribe_sync("foo").await.expect("sub foo");
    ivan.flush().await.expect("flush");
    admin.flush().await.expect("flush");

    // A denied publish in between must not disturb the allowed ones.
    ivan.publish("foo", "one").await.expect("publish");
    ivan.publish("baz", "denied").await.expect("queued");
    ivan.publish("foo", "two").await.expect("publish");
    ivan.flush().await.expect("flush");
    admin.publish("bar", "to-ivan").await.expect("publish");
    admin.flush().await.expect("flush");

    assert_eq!(drain(&outbound, QUIET).await, vec!["one", "two"]);
    assert_eq!(drain(&inbound, QUIET).await, vec!["to-ivan"]);
    let reported = next_event(&mut errors).await;
    assert!(reported.contains("publish") && reported.contains("baz"), "{reported}");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_lists_deny_everything() {
    let server = users_server().await;
    let (derek, mut errors) = connect_as(&server, "derek", "pass").await;

    derek.publish("anything", "x").await.expect("queued");
    let first = next_event(&mut errors).await;
    assert!(first.contains("publish"), "{first}");

    let _sub = derek.subscribe_sync(">").await.expect("queued");
    let second = next_event(&mut errors).await;
    assert!(second.contains("subscription"), "{second}");
    assert!(derek.is_connected());
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_keeps_permissions_of_live_connections() {
    let server = users_server().await;
    let (ivan_before, mut before_errors) = connect_as(&server, "ivan", "pwd").await;
    let (admin, _) = connect_as(&server, "admin", "admin").await;
    let watch = admin.subscribe_sync("foo").await.expect("sub");
    admin.flush().await.expect("flush");

    server
        .reload_users(&[
            user("ivan", "pwd", Some(vec![]), Some(vec![])),
            gmsg_authz::User::new("admin", "admin"),
        ])
        .expect("reload");

    ivan_before.publish("foo", "still allowed").await.expect("publish");
    ivan_before.flush().await.expect("flush");
    assert_eq!(drain(&watch, QUIET).await, vec!["still allowed"]);
    assert!(
        tokio::time::timeout(QUIET, before_errors.recv()).await.is_err(),
        "no violation for the existing link"
    );

    let (ivan_after, mut after_errors) = connect_as(&server, "ivan", "pwd").await;
    ivan_after.publish("foo", "denied now").await.expect("queued");
    let reported = next_event(&mut after_errors).await;
    assert!(reported.contains("publish") && reported.contains("foo"), "{reported}");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_removing_a_user_refuses_new_logins() {
    let server = users_server().await;
    server
        .reload_users(&[gmsg_authz::User::new("admin", "admin")])
        .expect("reload");
    let err = options(&server)
        .user_info("ivan", "pwd")
        .connect()
        .await
        .expect_err("ivan is gone");
    assert!(matches!(err, Error::Authorization));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn open_server_refuses_a_users_reload() {
    let server = start_open_server().await;
    let reloaded = server.reload_users(&[user("ivan", "pwd", Some(vec!["foo"]), Some(vec![]))]);
    assert!(reloaded.is_err());

    let anonymous = connect(&server).await;
    assert!(!anonymous.server_info().expect("info").auth_required);
    anonymous.close().await;
    server.shutdown().await;
}
