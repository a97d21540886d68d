// Needs a RabbitMQ server; point HUTCH_AMQP_ADDR at it and run with
// `--ignored`.

use std::time::Duration;

use rust_hutch::config::HutchConfig;
use rust_hutch::env::apply_env;
use rust_hutch::message::{Message, MessageMeta};
use rust_hutch::rabbitmq::MessagePublisher;
use rust_hutch::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_live_round_trip() {
    let mut config = HutchConfig::default();
    apply_env(&mut config).unwrap();
    let cancel = CancellationToken::new();
    let client = Client::from_config(&config, &cancel);

    let suffix = uuid::Uuid::new_v4();
    let exchange = client
        .new_topic_exchange(&format!("hutch.test.{}", suffix))
        .await
        .unwrap();
    let queue = client
        .new_queue(&format!("hutch.test.queue.{}", suffix))
        .await
        .unwrap();
    queue.bind(&exchange, "live.#").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = queue
        .subscribe(&cancel, move |message| {
            let _ = tx.send(message);
        })
        .await
        .unwrap();

    let message = Message::new(MessageMeta::generate("live.ping", "1"), json!({"n": 1}));
    exchange.publish(&message, "live.ping").await.unwrap();

    let received = timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.kind(), "live.ping");
    assert_eq!(received.data()["n"], json!(1));

    cancel.cancel();
    subscription.join().await;
    client.close().await.unwrap();
}
