use pushg::protocol::{Message, Path};
use pushg::route::{Route, RouteConfig};
use pushg::router::Router;
use pushg::store::{FetchDirection, FetchRequest, FileMessageStore};
use pushg::{BrokerConfig, MemoryKvStore, PushgError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn broker() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileMessageStore::new(dir.path()));
    let kv = Arc::new(MemoryKvStore::new());
    let router = Router::new(store, kv, &BrokerConfig::default());
    (dir, router)
}

fn publish(path: &str, body: &str) -> Message {
    Message::new(Path::new(path).unwrap(), body.to_owned())
}

async fn wait_for_subscription(router: &Router, topic: &str) {
    for _ in 0..200 {
        if router.get_subscribers(topic).as_array().map(Vec::len) > Some(0) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no subscription on {} appeared", topic);
}

#[tokio::test]
async fn two_subscribers_one_filtered() {
    let (_dir, router) = broker();

    let r1 = Route::new(RouteConfig::new(Path::new("/t").unwrap(), 10));
    let mut r1_rx = r1.take_channel().unwrap();
    router.subscribe(r1).await.unwrap();

    let mut params = BTreeMap::new();
    params.insert("user".to_owned(), "u1".to_owned());
    let r2 = Route::new(RouteConfig::new(Path::new("/t").unwrap(), 10).with_params(params));
    let mut r2_rx = r2.take_channel().unwrap();
    router.subscribe(r2).await.unwrap();

    let mut m = publish("/t", "for u2");
    m.set_filter("user", "u2");
    router.handle_message(m).await.unwrap();

    let got = r1_rx.recv().await.unwrap();
    assert_eq!(got.body_as_string(), "for u2");

    // r2 must not see it; a matching follow-up proves nothing was queued
    let mut follow_up = publish("/t", "for u1");
    follow_up.set_filter("user", "u1");
    router.handle_message(follow_up).await.unwrap();
    assert_eq!(r2_rx.recv().await.unwrap().body_as_string(), "for u1");
}

#[tokio::test]
async fn slow_subscriber_is_closed_and_dropped() {
    let (_dir, router) = broker();

    let route = Route::new(RouteConfig::new(Path::new("/t").unwrap(), 1));
    let _rx = route.take_channel().unwrap();
    router.subscribe(route.clone()).await.unwrap();

    router.handle_message(publish("/t", "one")).await.unwrap();
    router.handle_message(publish("/t", "two")).await.unwrap();

    for _ in 0..200 {
        if route.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(route.is_closed());
    assert_eq!(router.get_subscribers("/t"), serde_json::json!([]));
}

#[tokio::test]
async fn provide_drains_history_before_live_messages() {
    let (_dir, router) = broker();

    for i in 1..=3 {
        router
            .handle_message(publish("/t/sub", &format!("old-{}", i)))
            .await
            .unwrap();
    }

    let route = Route::new(
        RouteConfig::new(Path::new("/t/sub").unwrap(), 100).with_fetch(FetchRequest::new(
            "t",
            1,
            0,
            FetchDirection::Forward,
        )),
    );
    let mut rx = route.take_channel().unwrap();
    let provide = tokio::spawn(route.clone().provide(router.clone(), true));

    wait_for_subscription(&router, "/t/sub").await;
    router.handle_message(publish("/t/sub", "live-4")).await.unwrap();

    let mut bodies = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..4 {
        let m = rx.recv().await.unwrap();
        ids.push(m.id);
        bodies.push(m.body_as_string());
    }
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(bodies, vec!["old-1", "old-2", "old-3", "live-4"]);

    provide.await.unwrap().unwrap();
    router.unsubscribe(&route).await.unwrap();
}

#[tokio::test]
async fn provide_fails_while_router_is_stopping() {
    let (_dir, router) = broker();
    router.stop().await.unwrap();

    let route = Route::new(RouteConfig::new(Path::new("/t").unwrap(), 10));
    let err = route.provide(router.clone(), true).await.unwrap_err();
    assert!(matches!(err, PushgError::ModuleStopping(_)));
}

#[tokio::test]
async fn deliveries_keep_partition_order_per_route() {
    let (_dir, router) = broker();

    let route = Route::new(RouteConfig::new(Path::new("/ordered").unwrap(), 200));
    let mut rx = route.take_channel().unwrap();
    router.subscribe(route).await.unwrap();

    for i in 0..100 {
        router
            .handle_message(publish("/ordered", &format!("{}", i)))
            .await
            .unwrap();
    }

    let mut previous = 0;
    for _ in 0..100 {
        let m = rx.recv().await.unwrap();
        assert!(m.id > previous);
        previous = m.id;
    }
}
