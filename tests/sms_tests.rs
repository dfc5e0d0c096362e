use async_trait::async_trait;
use pushg::protocol::{Message, Path};
use pushg::router::Router;
use pushg::sms::{DeliveryReport, SmsGateway, SmsGatewayConfig, SmsPayload, SmsProvider};
use pushg::store::FileMessageStore;
use pushg::{BrokerConfig, MemoryKvStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct RecordingProvider {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SmsProvider for RecordingProvider {
    async fn submit(&self, sms: &SmsPayload) -> pushg::Result<DeliveryReport> {
        self.sent.lock().unwrap().push(sms.text.clone());
        Ok(DeliveryReport::success("msg-id"))
    }
}

fn broker(dir: &TempDir, kv: Arc<MemoryKvStore>) -> Router {
    let store = Arc::new(FileMessageStore::new(dir.path()));
    Router::new(store, kv, &BrokerConfig::default())
}

fn sms_message(text: &str) -> Message {
    let payload = SmsPayload {
        to: "+4915112345678".to_owned(),
        from: "gateway".to_owned(),
        text: text.to_owned(),
    };
    Message::new(
        Path::new("/sms").unwrap(),
        serde_json::to_vec(&payload).unwrap(),
    )
}

async fn wait_for_subscription(router: &Router, topic: &str) {
    for _ in 0..400 {
        if router.get_subscribers(topic).as_array().map(Vec::len) > Some(0) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no subscription on {} appeared", topic);
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not reached in time");
}

#[tokio::test]
async fn gateway_delivers_and_resumes_from_the_cursor() {
    let dir = TempDir::new().unwrap();
    let kv = Arc::new(MemoryKvStore::new());

    // first lifetime: three messages go out, the cursor follows
    {
        let router = broker(&dir, kv.clone());
        let provider = RecordingProvider::default();
        let sent = provider.sent.clone();
        let gateway = SmsGateway::new(router.clone(), provider, SmsGatewayConfig::default());
        gateway.start().await.unwrap();
        wait_for_subscription(&router, "/sms").await;

        for i in 1..=3 {
            router
                .handle_message(sms_message(&format!("text-{}", i)))
                .await
                .unwrap();
        }
        wait_until(|| gateway.last_id() == 3).await;
        assert_eq!(
            sent.lock().unwrap().clone(),
            vec!["text-1", "text-2", "text-3"]
        );

        gateway.stop().await.unwrap();
        router.stop().await.unwrap();
    }

    // restart: the cursor was persisted under the sms schema, so only the
    // new message is submitted
    {
        let router = broker(&dir, kv);
        let provider = RecordingProvider::default();
        let sent = provider.sent.clone();
        let gateway = SmsGateway::new(router.clone(), provider, SmsGatewayConfig::default());
        gateway.start().await.unwrap();
        assert_eq!(gateway.last_id(), 3);
        wait_for_subscription(&router, "/sms").await;

        router.handle_message(sms_message("text-4")).await.unwrap();
        wait_until(|| gateway.last_id() == 4).await;
        assert_eq!(sent.lock().unwrap().clone(), vec!["text-4"]);
    }
}

#[tokio::test]
async fn undecodable_body_does_not_wedge_the_gateway() {
    let dir = TempDir::new().unwrap();
    let kv = Arc::new(MemoryKvStore::new());
    let router = broker(&dir, kv);

    let provider = RecordingProvider::default();
    let sent = provider.sent.clone();
    let gateway = SmsGateway::new(router.clone(), provider, SmsGatewayConfig::default());
    gateway.start().await.unwrap();
    wait_for_subscription(&router, "/sms").await;

    router
        .handle_message(Message::new(Path::new("/sms").unwrap(), "not json"))
        .await
        .unwrap();
    router.handle_message(sms_message("after")).await.unwrap();

    wait_until(|| gateway.last_id() == 2).await;
    assert_eq!(sent.lock().unwrap().clone(), vec!["after"]);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let kv = Arc::new(MemoryKvStore::new());
    let router = broker(&dir, kv);

    let gateway = SmsGateway::new(
        router.clone(),
        RecordingProvider::default(),
        SmsGatewayConfig::default(),
    );
    gateway.start().await.unwrap();
    gateway.start().await.unwrap();
    gateway.stop().await.unwrap();
    gateway.stop().await.unwrap();
}
