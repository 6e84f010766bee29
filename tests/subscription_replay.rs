//! Subscription behavior across a live session: replay after reconnect,
//! mode-specific position handling, unsubscribe, and error isolation.

mod common;

use rtm_link::{
    events, Listener, RtmClient, SubscribeOpts, SubscriptionMode, SubscriptionState,
    UnsubscribeReason,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Broker for reconnect tests: acks the first subscribe, pushes one data
/// batch, drops the connection; later connections just ack subscribes.
async fn reconnecting_broker(sub_tx: mpsc::UnboundedSender<(usize, Value)>) -> String {
    common::start_broker(move |mut ws, index| {
        let sub_tx = sub_tx.clone();
        async move {
            let frame = common::recv_json(&mut ws).await.unwrap();
            assert_eq!(frame["action"], "rtm/subscribe");
            let sub_id = frame["body"]["subscription_id"].clone();
            let _ = sub_tx.send((index, frame["body"].clone()));

            let reply = json!({
                "action": "rtm/subscribe/ok",
                "id": frame["id"],
                "body": {"position": "101", "subscription_id": sub_id.clone()},
            });
            common::send_json(&mut ws, &reply).await;

            if index == 0 {
                let data = json!({
                    "action": "rtm/subscription/data",
                    "body": {
                        "position": "150",
                        "subscription_id": sub_id,
                        "messages": ["a", "b"],
                    },
                });
                common::send_json(&mut ws, &data).await;
                let _ = ws.close(None).await;
            } else {
                while common::recv_json(&mut ws).await.is_some() {}
            }
        }
    })
    .await
}

#[tokio::test]
async fn test_reliable_subscription_resumes_from_last_position() {
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
    let url = reconnecting_broker(sub_tx).await;

    let client = RtmClient::new(&url, "test-key").unwrap();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let listener = Listener::new().on_message(move |message| {
        let _ = msg_tx.send(message);
    });
    client
        .subscribe(
            "x",
            SubscriptionMode::Reliable,
            SubscribeOpts {
                position: Some("100".to_string()),
                ..Default::default()
            },
            listener,
        )
        .await
        .unwrap();
    client.start().unwrap();

    // first subscribe carries the registration-time position
    let (index, body) = timeout(WAIT, sub_rx.recv()).await.unwrap().unwrap();
    assert_eq!(index, 0);
    assert_eq!(body["subscription_id"], "x");
    assert_eq!(body["force"], true);
    assert_eq!(body["fast_forward"], true);
    assert_eq!(body["position"], "100");

    assert_eq!(timeout(WAIT, msg_rx.recv()).await.unwrap().unwrap(), json!("a"));
    assert_eq!(timeout(WAIT, msg_rx.recv()).await.unwrap().unwrap(), json!("b"));

    // after the drop, the resubscribe resumes from the last data position
    let (index, body) = timeout(WAIT, sub_rx.recv()).await.unwrap().unwrap();
    assert_eq!(index, 1);
    assert_eq!(body["subscription_id"], "x");
    assert_eq!(body["force"], true);
    assert_eq!(body["fast_forward"], true);
    assert_eq!(body["position"], "150");

    client.stop().await;
}

#[tokio::test]
async fn test_simple_subscription_restarts_without_position() {
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
    let url = reconnecting_broker(sub_tx).await;

    let client = RtmClient::new(&url, "test-key").unwrap();
    let (unsub_tx, mut unsub_rx) = mpsc::unbounded_channel();
    let listener = Listener::new().on_unsubscribed(move |reason| {
        let _ = unsub_tx.send(reason);
    });
    client
        .subscribe(
            "x",
            SubscriptionMode::Simple,
            SubscribeOpts {
                position: Some("100".to_string()),
                ..Default::default()
            },
            listener,
        )
        .await
        .unwrap();
    client.start().unwrap();

    let (_, body) = timeout(WAIT, sub_rx.recv()).await.unwrap().unwrap();
    assert_eq!(body["position"], "100");

    // the drop notifies the listener with a disconnect reason
    let reason = timeout(WAIT, unsub_rx.recv()).await.unwrap().unwrap();
    assert_eq!(reason, UnsubscribeReason::Disconnect);

    // the resubscribe omits position even though data was received
    let (index, body) = timeout(WAIT, sub_rx.recv()).await.unwrap().unwrap();
    assert_eq!(index, 1);
    assert!(body.get("position").is_none());
    assert_eq!(body["fast_forward"], true);

    client.stop().await;
}

#[tokio::test]
async fn test_subscription_error_is_isolated() {
    // acks every subscribe; after the second one, errors subscription "a"
    let url = common::start_broker(|mut ws, _index| async move {
        let mut acked = 0;
        while let Some(frame) = common::recv_json(&mut ws).await {
            if frame["action"] != "rtm/subscribe" {
                continue;
            }
            let sub_id = frame["body"]["subscription_id"].clone();
            let reply = json!({
                "action": "rtm/subscribe/ok",
                "id": frame["id"],
                "body": {"position": "1", "subscription_id": sub_id},
            });
            common::send_json(&mut ws, &reply).await;
            acked += 1;
            if acked == 2 {
                let err = json!({
                    "action": "rtm/subscription/error",
                    "body": {
                        "error": "expired_position",
                        "reason": "position expired",
                        "subscription_id": "a",
                    },
                });
                common::send_json(&mut ws, &err).await;
            }
        }
    })
    .await;

    let client = RtmClient::new(&url, "test-key").unwrap();
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    client.once(events::CONNECTED, move |_| {
        let _ = connected_tx.send(());
    });
    let (session_err_tx, mut session_err_rx) = mpsc::unbounded_channel();
    client.on(events::ERROR, move |payload| {
        let _ = session_err_tx.send(payload);
    });
    client.start().unwrap();
    timeout(WAIT, connected_rx.recv()).await.unwrap().unwrap();

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let listener_a = Listener::new().on_subscription_error(move |err| {
        let _ = err_tx.send(err);
    });
    let (sub_b_tx, mut sub_b_rx) = mpsc::unbounded_channel();
    let listener_b = Listener::new().on_subscribed(move |ok| {
        let _ = sub_b_tx.send(ok);
    });

    // subscribe while connected exercises the immediate-send path
    client
        .subscribe("a", SubscriptionMode::Reliable, SubscribeOpts::default(), listener_a)
        .await
        .unwrap();
    client
        .subscribe("b", SubscriptionMode::Reliable, SubscribeOpts::default(), listener_b)
        .await
        .unwrap();

    timeout(WAIT, sub_b_rx.recv()).await.unwrap().unwrap();
    let err = timeout(WAIT, err_rx.recv()).await.unwrap().unwrap();
    assert_eq!(err.error, "expired_position");
    assert_eq!(err.subscription_id, "a");

    // "a" left the registry; "b" is untouched
    assert_eq!(client.subscription_state("a"), None);
    assert_eq!(
        client.subscription_state("b"),
        Some(SubscriptionState::Subscribed)
    );

    // the session-level error event must not fire for a subscription error
    assert!(
        timeout(Duration::from_millis(300), session_err_rx.recv())
            .await
            .is_err()
    );

    client.stop().await;
}

#[tokio::test]
async fn test_unsubscribe_round_trip() {
    let url = common::start_broker(|mut ws, _index| async move {
        while let Some(frame) = common::recv_json(&mut ws).await {
            match frame["action"].as_str().unwrap_or_default() {
                "rtm/subscribe" => {
                    let sub_id = frame["body"]["subscription_id"].clone();
                    let reply = json!({
                        "action": "rtm/subscribe/ok",
                        "id": frame["id"],
                        "body": {"position": "1", "subscription_id": sub_id},
                    });
                    common::send_json(&mut ws, &reply).await;
                },
                "rtm/unsubscribe" => {
                    let reply = json!({
                        "action": "rtm/unsubscribe/ok",
                        "id": frame["id"],
                        "body": {},
                    });
                    common::send_json(&mut ws, &reply).await;
                },
                _ => {},
            }
        }
    })
    .await;

    let client = RtmClient::new(&url, "test-key").unwrap();
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
    let (unsub_tx, mut unsub_rx) = mpsc::unbounded_channel();
    let listener = Listener::new()
        .on_subscribed(move |ok| {
            let _ = sub_tx.send(ok);
        })
        .on_unsubscribed(move |reason| {
            let _ = unsub_tx.send(reason);
        });
    client
        .subscribe("s", SubscriptionMode::Reliable, SubscribeOpts::default(), listener)
        .await
        .unwrap();

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    client.once(events::CONNECTED, move |_| {
        let _ = connected_tx.send(());
    });
    client.start().unwrap();
    timeout(WAIT, connected_rx.recv()).await.unwrap().unwrap();

    timeout(WAIT, sub_rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        client.subscription_state("s"),
        Some(SubscriptionState::Subscribed)
    );

    client.unsubscribe("s").await.unwrap();
    let reason = timeout(WAIT, unsub_rx.recv()).await.unwrap().unwrap();
    assert_eq!(reason, UnsubscribeReason::Requested);
    assert_eq!(client.subscription_state("s"), None);

    client.stop().await;
}
