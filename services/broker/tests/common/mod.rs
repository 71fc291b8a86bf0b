// Shared helpers for broker integration tests.
#![allow(dead_code)]

use std::time::Duration;

use broker::{BrokerConfig, ServerHandle};
use gmsg_authz::{Permissions, User};
use gmsg_client::{Connection, Options, Subscription};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_server(config: BrokerConfig) -> ServerHandle {
    ServerHandle::start(config).await.expect("start broker")
}

pub async fn start_open_server() -> ServerHandle {
    start_server(BrokerConfig::local()).await
}

pub fn options(server: &ServerHandle) -> Options {
    Options::new()
        .url(server.client_url())
        .allow_reconnect(false)
        .timeout(Duration::from_secs(2))
}

pub async fn connect(server: &ServerHandle) -> Connection {
    options(server).connect().await.expect("connect")
}

pub fn user(
    name: &str,
    password: &str,
    publish: Option<Vec<&str>>,
    subscribe: Option<Vec<&str>>,
) -> User {
    let list = |subjects: Vec<&str>| subjects.into_iter().map(str::to_string).collect::<Vec<_>>();
    User::new(name, password).with_permissions(Permissions {
        publish: publish.map(list),
        subscribe: subscribe.map(list),
    })
}

/// Read every message currently reachable within `quiet`.
pub async fn drain(sub: &Subscription, quiet: Duration) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(msg) = sub.next_msg(quiet).await {
        out.push(String::from_utf8_lossy(&msg.payload).into_owned());
    }
    out
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("event before timeout")
        .expect("event channel open")
}

/// A TCP address with no listener behind it.
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("gio://{addr}")
}
