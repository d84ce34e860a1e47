//! Channel engine scenarios: reference counting, resubscription and delivery.

use rbx_sdk::prelude::*;
use rbx_sdk::TransportError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Connected transport whose server grants every channel except "forbidden",
/// and refuses everything while `refuse` is set.
fn server() -> (Arc<MemoryTransport>, Arc<AtomicBool>) {
    let refuse = Arc::new(AtomicBool::new(false));
    let refusing = Arc::clone(&refuse);
    let transport = MemoryTransport::connected().with_responder(move |event, payload| {
        if event != ">C" {
            return Err(TransportError::Rejected(json!("unknown event")));
        }
        let channel = payload["c"].as_str().unwrap_or_default();
        if channel == "forbidden" || refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(json!({"name": "AccessDenied"})));
        }
        Ok(Value::String(channel.to_string()))
    });
    (Arc::new(transport), refuse)
}

fn subscribes(transport: &MemoryTransport) -> usize {
    transport.requests_to(">C").len()
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ChannelEvent>, accept: F) -> ChannelEvent
where
    F: Fn(&ChannelEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if accept(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("expected channel event")
}

// ============================================================================
// Reference counting
// ============================================================================

#[tokio::test]
async fn test_shared_channel_subscribes_and_unsubscribes_once() {
    let (transport, _) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let first = client.channel();
    let second = client.channel();
    let room = SubscribeRequest::new("chat").with_member("room1");

    let id = first.subscribe(room.clone()).await.unwrap();
    let again = second.subscribe(room).await.unwrap();

    assert_eq!(id, again);
    assert_eq!(id.full_id(), "chat.room1");
    assert_eq!(subscribes(&transport), 1);
    assert_eq!(client.channel_engine().interest_count(&id), 2);

    first.unsubscribe(&id).await.unwrap();
    assert!(transport.requests_to("chat.room1").is_empty());
    assert!(second.is_subscribed(&id));

    second.unsubscribe(&id).await.unwrap();
    assert_eq!(transport.requests_to("chat.room1"), vec![json!([0])]);
    assert_eq!(client.channel_engine().interest_count(&id), 0);
}

#[tokio::test]
async fn test_failed_subscribe_only_reaches_caller() {
    let (transport, _) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let holder = client.channel();
    let chat = holder.subscribe(SubscribeRequest::new("chat")).await.unwrap();
    let mut holder_events = holder.events();

    let denied = client.channel();
    let result = denied.subscribe(SubscribeRequest::new("forbidden")).await;

    match result {
        Err(ClientError::SubscriptionFailed { reason }) => {
            assert_eq!(reason, json!({"name": "AccessDenied"}))
        }
        other => panic!("expected subscription failure, got {other:?}"),
    }
    assert!(denied.subscriptions().is_empty());
    assert_eq!(holder.subscriptions(), vec![chat]);
    assert!(holder_events.try_recv().is_err());
}

#[tokio::test]
async fn test_concurrent_subscribes_share_one_request() {
    let (transport, _) = server();
    transport.set_response_delay(Some(Duration::from_millis(20)));
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let first = client.channel();
    let second = client.channel();
    let room = SubscribeRequest::new("chat").with_member("room1");

    let (a, b) = tokio::join!(first.subscribe(room.clone()), second.subscribe(room));
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a, b);
    assert_eq!(subscribes(&transport), 1);
    assert_eq!(client.channel_engine().interest_count(&a), 2);
    assert!(first.is_subscribed(&a));
    assert!(second.is_subscribed(&a));
}

#[tokio::test]
async fn test_concurrent_subscribes_share_refusal() {
    let (transport, _) = server();
    transport.set_response_delay(Some(Duration::from_millis(20)));
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let first = client.channel();
    let second = client.channel();
    let denied = SubscribeRequest::new("forbidden");

    let (a, b) = tokio::join!(first.subscribe(denied.clone()), second.subscribe(denied));

    assert!(matches!(a, Err(ClientError::SubscriptionFailed { .. })));
    assert!(matches!(b, Err(ClientError::SubscriptionFailed { .. })));
    assert_eq!(subscribes(&transport), 1);
    assert!(first.subscriptions().is_empty());
    assert!(second.subscriptions().is_empty());
}

#[tokio::test]
async fn test_cancelled_subscribe_does_not_block_next() {
    let (transport, _) = server();
    transport.set_response_delay(Some(Duration::from_millis(50)));
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let first = client.channel();
    let second = client.channel();
    let chat = SubscribeRequest::new("chat");

    let cancelled = tokio::time::timeout(Duration::from_millis(5), first.subscribe(chat.clone())).await;
    assert!(cancelled.is_err());

    let id = second.subscribe(chat).await.unwrap();
    assert_eq!(subscribes(&transport), 2);
    assert_eq!(client.channel_engine().interest_count(&id), 1);
    assert!(!first.is_subscribed(&id));
}

#[tokio::test]
async fn test_dropped_handle_releases_interest() {
    let (transport, _) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let news = {
        let handle = client.channel();
        handle.subscribe(SubscribeRequest::new("news")).await.unwrap()
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.channel_engine().interest_count(&news), 0);
    assert_eq!(transport.requests_to("news"), vec![json!([0])]);
}

// ============================================================================
// Resubscription
// ============================================================================

#[tokio::test]
async fn test_resubscribe_once_per_channel() {
    let (transport, _) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let a = client.channel();
    let b = client.channel();
    let c = client.channel();
    a.subscribe(SubscribeRequest::new("chat")).await.unwrap();
    b.subscribe(SubscribeRequest::new("chat")).await.unwrap();
    c.subscribe(SubscribeRequest::new("news")).await.unwrap();
    transport.clear_requests();

    let issued = client.channel_engine().resubscribe_all().await;

    assert_eq!(issued, 2);
    assert_eq!(subscribes(&transport), 2);
}

#[tokio::test]
async fn test_reconnect_resubscribes_registered_channels() {
    let (transport, _) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let a = client.channel();
    let b = client.channel();
    let c = client.channel();
    let chat = a.subscribe(SubscribeRequest::new("chat")).await.unwrap();
    b.subscribe(SubscribeRequest::new("chat")).await.unwrap();
    c.subscribe(SubscribeRequest::new("news")).await.unwrap();
    let mut events = a.events();
    transport.clear_requests();

    transport.go_offline();
    assert_eq!(
        wait_for(&mut events, |_| true).await,
        ChannelEvent::ConnectionLost
    );

    transport.go_online();
    let subscribed = wait_for(&mut events, |e| matches!(e, ChannelEvent::Subscribed { .. })).await;
    assert_eq!(subscribed, ChannelEvent::Subscribed { channel: chat });
    assert_eq!(subscribes(&transport), 2);
}

#[tokio::test]
async fn test_failed_resubscribe_keeps_registration() {
    let (transport, refuse) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let handle = client.channel();
    let chat = handle.subscribe(SubscribeRequest::new("chat")).await.unwrap();
    let mut events = handle.events();

    refuse.store(true, Ordering::SeqCst);
    assert_eq!(client.channel_engine().resubscribe_all().await, 1);

    let failed = wait_for(&mut events, |_| true).await;
    assert_eq!(
        failed,
        ChannelEvent::SubscribeFailed {
            request: SubscribeRequest::new("chat"),
            reason: json!({"name": "AccessDenied"}),
        }
    );
    assert!(handle.is_subscribed(&chat));

    refuse.store(false, Ordering::SeqCst);
    assert_eq!(client.channel_engine().resubscribe_all().await, 1);
    assert_eq!(
        wait_for(&mut events, |_| true).await,
        ChannelEvent::Subscribed { channel: chat }
    );
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_publish_reaches_every_interested_handle() {
    let (transport, _) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let first = client.channel();
    let second = client.channel();
    let outsider = client.channel();
    let room = SubscribeRequest::new("chat").with_member("room1");
    let id = first.subscribe(room.clone()).await.unwrap();
    second.subscribe(room).await.unwrap();
    outsider
        .subscribe(SubscribeRequest::new("chat").with_member("room2"))
        .await
        .unwrap();
    let mut first_events = first.events();
    let mut second_events = second.events();
    let mut outsider_events = outsider.events();

    transport.deliver(
        "C>P",
        json!({"i": "chat", "m": "room1", "e": "message", "d": "hello"}),
    );

    let expected = ChannelEvent::Publish {
        channel: id,
        event: "message".into(),
        data: Some(json!("hello")),
    };
    assert_eq!(wait_for(&mut first_events, |_| true).await, expected);
    assert_eq!(wait_for(&mut second_events, |_| true).await, expected);
    assert!(outsider_events.try_recv().is_err());
}

#[tokio::test]
async fn test_kick_out_removes_registration() {
    let (transport, _) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let handle = client.channel();
    let id = handle.subscribe(SubscribeRequest::new("chat")).await.unwrap();
    let mut events = handle.events();

    transport.deliver("C>P", json!({"broken": true}));
    transport.deliver("C>K", json!({"i": "chat", "c": 4001, "d": "spam"}));

    let kicked = wait_for(&mut events, |_| true).await;
    assert_eq!(
        kicked,
        ChannelEvent::KickedOut {
            channel: id.clone(),
            code: Some(json!(4001)),
            data: Some(json!("spam")),
        }
    );
    assert!(!handle.is_subscribed(&id));
    assert!(transport.requests_to("chat").is_empty());
}

#[tokio::test]
async fn test_unsubscribe_all_by_identifier() {
    let (transport, _) = server();
    let client = Client::new(Arc::clone(&transport), ClientConfig::default());
    let handle = client.channel();
    let room1 = handle
        .subscribe(SubscribeRequest::new("chat").with_member("room1"))
        .await
        .unwrap();
    let room2 = handle
        .subscribe(SubscribeRequest::new("chat").with_member("room2"))
        .await
        .unwrap();
    let news = handle.subscribe(SubscribeRequest::new("news")).await.unwrap();

    let released = client
        .channel_engine()
        .unsubscribe_all(Some("chat"))
        .await
        .unwrap();

    assert_eq!(released, 2);
    assert_eq!(handle.subscriptions(), vec![news]);
    assert_eq!(transport.requests_to(&room1.full_id()), vec![json!([0])]);
    assert_eq!(transport.requests_to(&room2.full_id()), vec![json!([0])]);

    handle.unsubscribe_all().await.unwrap();
    assert!(handle.subscriptions().is_empty());
    assert_eq!(transport.requests_to("news"), vec![json!([0])]);
}
