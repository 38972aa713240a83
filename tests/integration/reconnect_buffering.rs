//! A site losing its supervisor connection keeps StatusUpdates and delivers
//! them, marked old, once it has reconnected.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use rsmp::protocol::{Message, Quality, StatusItem};
use rsmp::proxy::{CollectOptions, Collector, Proxy, SendOutcome};
use rsmp::ProxyState;
use serde_json::json;
use site::Site;
use supervisor::Supervisor;

const SITE_ID: &str = "RN+SI0001";
const WAIT: Duration = Duration::from_secs(5);

async fn start_supervisor() -> (Supervisor, SocketAddr) {
    let config = supervisor::config::load_config_from_str(
        "schema_version = 1\nbind = \"127.0.0.1:0\"\n[guest]\n",
    )
    .unwrap();
    let supervisor = Supervisor::new(config);
    let addr = supervisor.start().await.unwrap();
    (supervisor, addr)
}

fn start_site(addr: SocketAddr) -> Site {
    let config = site::config::load_config_from_str(&format!(
        "schema_version = 1\nsite_id = \"{}\"\nbuffer_capacity = 2\n\
         [[supervisors]]\nip = \"{}\"\nport = {}\n\
         [intervals]\ntimer = 0.02\nreconnect = 30\n\
         [[components]]\nid = \"TC\"\ntype = \"main\"\n",
        SITE_ID,
        addr.ip(),
        addr.port()
    ))
    .unwrap();
    let site = Site::new(config);
    site.start();
    site
}

async fn reach(proxy: &Proxy, target: ProxyState) {
    let mut states = proxy.watch_state();
    tokio::time::timeout(WAIT, states.wait_for(|state| *state == target))
        .await
        .expect("state not reached")
        .unwrap();
}

fn update(value: &str) -> Message {
    Message::status_update(
        "TC",
        &[StatusItem {
            code: "S0001".to_owned(),
            name: "signalgroupstatus".to_owned(),
            value: json!(value),
            quality: Quality::Recent,
        }],
        Utc::now(),
    )
}

#[tokio::test]
async fn buffered_updates_arrive_old_after_reconnect() {
    let (supervisor, addr) = start_supervisor().await;
    let site = start_site(addr);
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();
    let site_proxy = site.proxy().unwrap().clone();

    remote.proxy().stop();
    reach(remote.proxy(), ProxyState::Stopped).await;
    reach(&site_proxy, ProxyState::WaitForReconnect).await;

    // Capacity 2: the oldest of three is dropped.
    for value in ["A", "B", "C"] {
        assert!(matches!(
            site_proxy.send(update(value)).await,
            Ok(SendOutcome::Buffered)
        ));
    }
    assert_eq!(site_proxy.buffered().len(), 2);

    let collector = Collector::new(
        remote.proxy(),
        CollectOptions::new()
            .types(["StatusUpdate"])
            .num(2)
            .timeout(WAIT),
    );
    site.reconnect_now();
    let messages = collector.collect().await.into_messages().unwrap();

    let values: Vec<_> = messages
        .iter()
        .map(|m| m.status_items().unwrap()[0].clone())
        .collect();
    assert_eq!(values[0].value, json!("B"));
    assert_eq!(values[1].value, json!("C"));
    assert!(values.iter().all(|item| item.quality == Quality::Old));

    reach(&site_proxy, ProxyState::Ready).await;
    assert!(site_proxy.buffered().is_empty());

    site.shutdown().await;
    supervisor.shutdown().await;
}

#[tokio::test]
async fn non_status_messages_are_not_buffered() {
    let (supervisor, addr) = start_supervisor().await;
    let site = start_site(addr);
    supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();
    supervisor.shutdown().await;

    let site_proxy = site.proxy().unwrap().clone();
    reach(&site_proxy, ProxyState::WaitForReconnect).await;
    let watchdog = Message::watchdog(Utc::now());
    assert!(site_proxy.send(watchdog).await.is_err());
    assert!(site_proxy.buffered().is_empty());

    site.shutdown().await;
}
