//! Integration tests against a live Asterisk instance.
//!
//! These tests require AMI on 127.0.0.1:5038 with user `admin` / `amp111`
//! (`manager.conf`), and the HTTP manager on 127.0.0.1:8088 for the HTTP test.
//! Run with: cargo test --test live_asterisk -- --ignored

use asterisk_ami_tokio::{Action, Manager, ManagerOptions, Message};
use std::time::Duration;
use tokio::sync::mpsc;

const AMI_HOST: &str = "127.0.0.1";
const AMI_PORT: u16 = 5038;
const AMI_USER: &str = "admin";
const AMI_SECRET: &str = "amp111";
const HTTP_URL: &str = "http://127.0.0.1:8088/asterisk/";

fn options() -> ManagerOptions {
    ManagerOptions::new(AMI_HOST, AMI_USER, AMI_SECRET)
        .with_port(AMI_PORT)
        .with_action_timeout(Duration::from_secs(10))
}

async fn connect() -> Manager {
    let manager = Manager::new(options());
    manager
        .connect()
        .await
        .expect("failed to connect to Asterisk");
    manager
}

#[tokio::test]
#[ignore]
async fn live_connect_and_ping() {
    let manager = connect().await;
    assert!(manager.is_connected());
    assert!(manager
        .server_version()
        .is_some_and(|v| v.starts_with("Asterisk Call Manager/")));

    let pong = manager
        .send_action(Action::ping())
        .await
        .unwrap();
    assert!(pong.success());
    assert_eq!(pong.header("Ping"), Some("Pong"));
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_core_show_uptime() {
    let manager = connect().await;
    let response = manager
        .command("core show uptime")
        .await
        .unwrap();
    assert!(response.success());
    assert!(
        response
            .content()
            .contains("uptime"),
        "unexpected output: {}",
        response.content()
    );
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_unknown_action_fails() {
    let manager = connect().await;
    let response = manager
        .send_action(Action::named("NoSuchAction"))
        .await
        .unwrap();
    assert!(!response.success());
    assert!(response
        .into_result()
        .is_err());
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_list_core_show_channels() {
    let manager = connect().await;
    let messages = manager
        .send_list_action(Action::named("CoreShowChannels"))
        .await
        .unwrap();
    assert!(messages[0].success());
    assert!(messages
        .last()
        .unwrap()
        .is_list_end());
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_user_event_round_trip() {
    let manager = connect().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.register_event("UserEvent", move |event: &Message, _: &Manager| {
        let _ = tx.send(event.clone());
    });

    let response = manager
        .send_action(Action::new([
            ("Action", "UserEvent"),
            ("UserEvent", "ami_tokio_test"),
            ("Payload", "42"),
        ]))
        .await
        .unwrap();
    assert!(response.success());

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for UserEvent")
        .expect("channel closed");
    assert_eq!(event.header("UserEvent"), Some("ami_tokio_test"));
    assert_eq!(event.header("Payload"), Some("42"));
    manager
        .close()
        .await;
}

#[tokio::test]
#[ignore]
async fn live_http_login_and_ping() {
    let manager = Manager::new(options().with_http(HTTP_URL));
    manager
        .connect()
        .await
        .expect("HTTP login failed");
    let pong = manager
        .send_action(Action::ping())
        .await
        .unwrap();
    assert!(pong.success());
    manager
        .close()
        .await;
}
