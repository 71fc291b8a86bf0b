mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use broker::BrokerConfig;
use common::*;
use gmsg_client::{EncodedConnection, Error};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const QUIET: Duration = Duration::from_millis(200);

#[tokio::test(flavor = "multi_thread")]
async fn publish_reaches_literal_and_wildcard_subscribers() {
    let server = start_open_server().await;
    let sub_conn = connect(&server).await;
    let pub_conn = connect(&server).await;

    let literal = sub_conn.subscribe_sync("orders.eu.created").await.expect("sub");
    let partial = sub_conn.subscribe_sync("orders.*.created").await.expect("sub");
    let full = sub_conn.subscribe_sync("orders.>").await.expect("sub");
    let other = sub_conn.subscribe_sync("invoices.>").await.expect("sub");
    sub_conn.flush().await.expect("flush");

    pub_conn
        .publish("orders.eu.created", "o-1")
        .await
        .expect("publish");
    pub_conn.publish("orders.us", "o-2").await.expect("publish");
    pub_conn.flush().await.expect("flush");

    assert_eq!(drain(&literal, QUIET).await, vec!["o-1"]);
    assert_eq!(drain(&partial, QUIET).await, vec!["o-1"]);
    assert_eq!(drain(&full, QUIET).await, vec!["o-1", "o-2"]);
    assert!(drain(&other, QUIET).await.is_empty());

    let msg_stats = pub_conn.stats();
    assert_eq!(msg_stats.out_msgs, 2);
    sub_conn.close().await;
    pub_conn.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_group_members_share_the_stream() {
    let server = start_open_server().await;
    let conn = connect(&server).await;
    let pub_conn = connect(&server).await;

    let mut members = Vec::new();
    for _ in 0..3 {
        members.push(
            conn.queue_subscribe_sync("work", "workers")
                .await
                .expect("queue sub"),
        );
    }
    let audit = conn.subscribe_sync("work").await.expect("sub");
    conn.flush().await.expect("flush");

    for n in 0..30 {
        pub_conn.publish("work", format!("job-{n}")).await.expect("publish");
    }
    pub_conn.flush().await.expect("flush");

    let mut total = 0;
    for member in &members {
        let got = drain(member, QUIET).await.len();
        assert_eq!(got, 10, "round robin gives each member an equal share");
        total += got;
    }
    assert_eq!(total, 30);
    assert_eq!(drain(&audit, QUIET).await.len(), 30);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn request_gets_first_reply() {
    let server = start_open_server().await;
    let responder = connect(&server).await;
    let requester = connect(&server).await;

    let handle = responder.clone();
    responder
        .subscribe("help", move |msg| {
            let conn = handle.clone();
            tokio::spawn(async move {
                let _ = conn.respond(&msg, "I can help").await;
                let _ = conn.respond(&msg, "second answer").await;
            });
        })
        .await
        .expect("responder sub");
    responder.flush().await.expect("flush");

    let reply = requester
        .request("help", "please", Duration::from_secs(2))
        .await
        .expect("reply");
    assert_eq!(&reply.payload[..], b"I can help");
    assert!(reply.subject.starts_with("_INBOX."));

    let err = requester
        .request("nobody.home", "hello", Duration::from_millis(100))
        .await
        .expect_err("no responder");
    assert!(matches!(err, Error::Timeout));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_unsubscribe_stops_after_max() {
    let server = start_open_server().await;
    let conn = connect(&server).await;
    let pub_conn = connect(&server).await;

    let sub = conn.subscribe_sync("ticks").await.expect("sub");
    sub.auto_unsubscribe(2).await.expect("auto unsub");
    conn.flush().await.expect("flush");

    for n in 0..5 {
        pub_conn.publish("ticks", format!("{n}")).await.expect("publish");
    }
    pub_conn.flush().await.expect("flush");

    assert_eq!(drain(&sub, QUIET).await, vec!["0", "1"]);
    assert!(matches!(sub.next_msg(QUIET).await, Err(Error::MaxMessages)));
    assert!(!sub.is_valid());
    assert_eq!(conn.subscription_count(), 0);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_subscription_runs_in_order() {
    let server = start_open_server().await;
    let conn = connect(&server).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = conn
        .subscribe("seq", move |msg| {
            let _ = tx.send(String::from_utf8_lossy(&msg.payload).into_owned());
        })
        .await
        .expect("sub");
    for n in 0..20 {
        conn.publish("seq", format!("{n}")).await.expect("publish");
    }
    conn.flush().await.expect("flush");
    for n in 0..20 {
        assert_eq!(next_event(&mut rx).await, n.to_string());
    }
    sub.unsubscribe().await.expect("unsubscribe");
    conn.publish("seq", "late").await.expect("publish");
    conn.flush().await.expect("flush");
    if let Ok(Some(late)) = tokio::time::timeout(QUIET, rx.recv()).await {
        panic!("delivered after unsubscribe: {late}");
    }
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_subject_is_reported_without_closing() {
    let server = start_open_server().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = options(&server)
        .error_callback(move |_, err| {
            let _ = tx.send(err.to_string());
        })
        .connect()
        .await
        .expect("connect");

    conn.publish("foo.*", "wild").await.expect("client accepts shape");
    let reported = next_event(&mut rx).await;
    assert!(reported.contains("invalid subject"), "{reported}");
    conn.flush().await.expect("link still up");
    assert!(conn.is_connected());
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_payload_is_refused_client_side() {
    let config = BrokerConfig {
        max_payload: 16,
        ..BrokerConfig::local()
    };
    let server = start_server(config).await;
    let conn = connect(&server).await;
    assert_eq!(conn.max_payload(), 16);
    let err = conn
        .publish("big", vec![0u8; 17])
        .await
        .expect_err("too big");
    assert!(matches!(err, Error::MaxPayload { size: 17, max: 16 }));
    conn.publish("small", vec![0u8; 16]).await.expect("fits");
    conn.flush().await.expect("flush");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn verbose_clients_still_work() {
    let server = start_open_server().await;
    let conn = options(&server)
        .verbose(true)
        .connect()
        .await
        .expect("connect");
    let sub = conn.subscribe_sync("v").await.expect("sub");
    conn.publish("v", "ok").await.expect("publish");
    conn.flush().await.expect("flush");
    assert_eq!(drain(&sub, QUIET).await, vec!["ok"]);
    server.shutdown().await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

#[tokio::test(flavor = "multi_thread")]
async fn encoded_connection_round_trips_json() {
    let server = start_open_server().await;
    let encoded = EncodedConnection::json(connect(&server).await);
    let received = Arc::new(AtomicUsize::new(0));

    let (tx, mut rx) = mpsc::channel::<Order>(8);
    encoded
        .bind_recv_channel("orders", tx)
        .await
        .expect("bind recv");
    let counter = Arc::clone(&received);
    encoded
        .subscribe("orders", move |decoded: gmsg_client::Decoded<Order>| {
            assert_eq!(decoded.subject, "orders");
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("typed sub");
    encoded.flush().await.expect("flush");

    let send = encoded.bind_send_channel::<Order>("orders");
    let order = Order {
        id: 7,
        item: "widget".to_string(),
    };
    send.send(order.clone()).await.expect("send");

    let got = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("decoded in time")
        .expect("channel open");
    assert_eq!(got, order);
    encoded.flush().await.expect("flush");
    tokio::time::sleep(QUIET).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    encoded.close().await;
    server.shutdown().await;
}
