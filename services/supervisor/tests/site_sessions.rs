//! Integration tests for the supervisor node with mock sites.

use std::time::Duration;

use chrono::Utc;
use rsmp_protocol::{
    AlarmKind, CommandArg, CommandReturn, Message, MessageType, Quality, StatusItem, StatusRef,
    SubscribeItem,
};
use rsmp_proxy::{AggregatedFlag, AlarmState, CollectError, ProxyState};
use rsmp_test_utils::MockPeer;
use serde_json::json;
use supervisor::config::load_config_from_str;
use supervisor::{RequestError, Supervisor};

const SITE_ID: &str = "RN+SI0001";
const WAIT: Duration = Duration::from_secs(5);

fn config(guest: bool) -> String {
    let mut toml = r#"
schema_version = 1
bind = "127.0.0.1:0"
core_versions = ["3.1.5", "3.2"]

[intervals]
timer = 0.02
watchdog = 0.2

[timeouts]
watchdog = 10
acknowledgement = 10

[sites."RN+SI0001"]
sxl = { version = "1.2.1" }
"#
    .to_owned();
    if guest {
        toml.push_str("\n[guest]\n");
    }
    toml
}

async fn started(guest: bool) -> (Supervisor, std::net::SocketAddr) {
    let supervisor = Supervisor::new(load_config_from_str(&config(guest)).unwrap());
    let addr = supervisor.start().await.unwrap();
    (supervisor, addr)
}

/// Connect a mock site and complete the handshake.
async fn site(addr: std::net::SocketAddr, site_id: &str) -> MockPeer {
    let mut peer = MockPeer::connect(addr).await.unwrap();
    peer.handshake_as_site(site_id, &["3.1.4", "3.1.5", "3.2"], "1.2.1")
        .await
        .unwrap();
    peer
}

fn status_item(code: &str, name: &str, value: serde_json::Value) -> StatusItem {
    StatusItem {
        code: code.to_owned(),
        name: name.to_owned(),
        value,
        quality: Quality::Recent,
    }
}

#[tokio::test]
async fn known_site_is_served_and_tracked() {
    let (supervisor, addr) = started(false).await;
    let mut peer = MockPeer::connect(addr).await.unwrap();
    let reply = peer
        .handshake_as_site(SITE_ID, &["3.1.4", "3.1.5", "3.2"], "1.2.1")
        .await
        .unwrap();
    assert_eq!(reply.core_versions().unwrap(), vec!["3.2".to_owned()]);
    assert_eq!(reply.site_ids().unwrap(), vec![SITE_ID.to_owned()]);

    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();
    assert_eq!(remote.proxy().core_version().as_deref(), Some("3.2"));
    assert_eq!(supervisor.site_ids().await, vec![SITE_ID.to_owned()]);
    peer.expect("Watchdog").await.unwrap();

    let mut bits = [false; 8];
    bits[AggregatedFlag::Normal.index()] = true;
    let status = Message::aggregated_status("TC", bits, None, None, Utc::now());
    peer.send(&status).await.unwrap();
    let ack = peer.expect_ack_of(status.m_id().unwrap()).await.unwrap();
    assert_eq!(ack.message_type(), MessageType::MessageAck);
    remote.with_components(|registry| {
        let tc = registry.get("TC").unwrap();
        assert!(tc.is_stub());
        assert!(tc.aggregated_status.is_set(AggregatedFlag::Normal));
    });

    let mut alarm = AlarmState::new("TC", "A0302").with_category("T", 1);
    alarm.activate(Utc::now());
    peer.send(&alarm.to_message(AlarmKind::Issue)).await.unwrap();
    // Records are handled in order: once the watchdog is acked the alarm is in.
    let marker = peer.send_watchdog().await.unwrap();
    peer.expect_ack_of(marker.m_id().unwrap()).await.unwrap();
    remote.with_components(|registry| {
        assert!(registry.get("TC").unwrap().alarm("A0302").unwrap().is_active());
    });

    supervisor.shutdown().await;
    assert!(peer.closed_within(WAIT).await);
}

#[tokio::test]
async fn unknown_site_is_refused_without_guest_profile() {
    let (supervisor, addr) = started(false).await;
    let mut peer = MockPeer::connect(addr).await.unwrap();
    let version = Message::version(&["RN+SI0099".to_owned()], &["3.2".to_owned()], "1.2.1");
    peer.send(&version).await.unwrap();
    let not_ack = peer.expect_ack_of(version.m_id().unwrap()).await.unwrap();
    assert_eq!(not_ack.message_type(), MessageType::MessageNotAck);
    assert_eq!(not_ack.reason(), Some("unknown site 'RN+SI0099'"));
    assert!(peer.closed_within(WAIT).await);
    assert!(supervisor.site("RN+SI0099").await.is_none());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn guest_profile_admits_unlisted_sites() {
    let (supervisor, addr) = started(true).await;
    let _peer = site(addr, "RN+SI0042").await;
    let remote = supervisor.wait_for_site("RN+SI0042", WAIT).await.unwrap();
    assert_eq!(remote.site_id(), "RN+SI0042");
    supervisor.shutdown().await;
}

#[tokio::test]
async fn first_message_must_be_version() {
    let (supervisor, addr) = started(false).await;
    let mut peer = MockPeer::connect(addr).await.unwrap();
    peer.send_watchdog().await.unwrap();
    assert!(peer.closed_within(WAIT).await);
    assert!(supervisor.site_ids().await.is_empty());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn second_connection_is_closed_and_reconnect_reuses_site() {
    let (supervisor, addr) = started(false).await;
    let mut first = site(addr, SITE_ID).await;
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();

    let status = Message::aggregated_status("TC", [false; 8], None, None, Utc::now());
    first.send(&status).await.unwrap();
    first.expect_ack_of(status.m_id().unwrap()).await.unwrap();

    let mut duplicate = MockPeer::connect(addr).await.unwrap();
    let version = Message::version(&[SITE_ID.to_owned()], &["3.2".to_owned()], "1.2.1");
    duplicate.send(&version).await.unwrap();
    assert!(duplicate.closed_within(WAIT).await);
    assert_eq!(remote.proxy().state(), ProxyState::Ready);

    drop(first);
    let mut states = remote.proxy().watch_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ProxyState::Stopped))
        .await
        .unwrap()
        .unwrap();

    let _second = site(addr, SITE_ID).await;
    let again = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();
    again.with_components(|registry| assert!(registry.get("TC").is_ok()));
    assert_eq!(supervisor.site_ids().await.len(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn request_status_collects_response() {
    let (supervisor, addr) = started(false).await;
    let mut peer = site(addr, SITE_ID).await;
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();

    let refs = [
        StatusRef::new("S0001", "signalgroupstatus"),
        StatusRef::new("S0005", "status"),
    ];
    let (values, _) = tokio::join!(remote.request_status("TC", &refs, WAIT), async {
        let request = peer.expect("StatusRequest").await.unwrap();
        let response = Message::status_response(
            "TC",
            &[
                status_item("S0005", "status", json!(true)),
                status_item("S0001", "signalgroupstatus", json!("A1B1")),
            ],
            Utc::now(),
        );
        assert_eq!(request.status_refs().unwrap().len(), 2);
        peer.send(&response).await.unwrap();
    });
    let values = values.unwrap();
    assert_eq!(values[0].code, "S0001");
    assert_eq!(values[0].value, json!("A1B1"));
    assert_eq!(values[1].value, json!(true));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn subscription_waits_for_first_update() {
    let (supervisor, addr) = started(false).await;
    let mut peer = site(addr, SITE_ID).await;
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();

    let items = [SubscribeItem {
        code: "S0001".to_owned(),
        name: "signalgroupstatus".to_owned(),
        update_rate: "0".to_owned(),
        send_on_change: Some(true),
    }];
    let (first, _) = tokio::join!(
        remote.subscribe_to_status("TC", &items, Some(WAIT)),
        async {
            peer.expect("StatusSubscribe").await.unwrap();
            let update = Message::status_update(
                "TC",
                &[status_item("S0001", "signalgroupstatus", json!("A1"))],
                Utc::now(),
            );
            peer.send(&update).await.unwrap();
        }
    );
    let first = first.unwrap().unwrap();
    assert_eq!(first[0].value, json!("A1"));

    remote
        .unsubscribe_to_status("TC", &[StatusRef::new("S0001", "signalgroupstatus")])
        .await
        .unwrap();
    peer.expect("StatusUnsubscribe").await.unwrap();

    supervisor.shutdown().await;
}

#[tokio::test]
async fn rejected_command_ends_the_wait() {
    let (supervisor, addr) = started(false).await;
    let mut peer = site(addr, SITE_ID).await;
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();
    peer.set_auto_ack(false);

    let args = [CommandArg {
        code: "M0001".to_owned(),
        name: "status".to_owned(),
        operation: "setValue".to_owned(),
        value: json!("YellowFlash"),
    }];
    let (result, _) = tokio::join!(remote.send_command("TC", &args, WAIT), async {
        let request = peer.expect("CommandRequest").await.unwrap();
        peer.not_ack(&request, "unknown command 'M0001'").await.unwrap();
    });
    match result {
        Err(RequestError::Collect(CollectError::MessageRejected(reason))) => {
            assert_eq!(reason, "unknown command 'M0001'");
        }
        other => panic!("expected rejection, got {:?}", other.map(|r| r.len())),
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn command_returns_are_collected() {
    let (supervisor, addr) = started(false).await;
    let mut peer = site(addr, SITE_ID).await;
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();

    let args = [CommandArg {
        code: "M0001".to_owned(),
        name: "status".to_owned(),
        operation: "setValue".to_owned(),
        value: json!("NormalControl"),
    }];
    let (result, _) = tokio::join!(remote.send_command("TC", &args, WAIT), async {
        peer.expect("CommandRequest").await.unwrap();
        let response = Message::command_response(
            "TC",
            &[CommandReturn {
                code: "M0001".to_owned(),
                name: "status".to_owned(),
                value: json!("NormalControl"),
                age: "recent".to_owned(),
            }],
            Utc::now(),
        );
        peer.send(&response).await.unwrap();
    });
    let returns = result.unwrap();
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].value, json!("NormalControl"));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn alarm_acknowledgement_round_trip() {
    let (supervisor, addr) = started(false).await;
    let mut peer = site(addr, SITE_ID).await;
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();

    let (reply, _) = tokio::join!(
        remote.acknowledge_alarm("DL1", "A0302", WAIT),
        async {
            let request = peer
                .recv_matching(|m| m.message_type() == MessageType::Alarm(AlarmKind::Acknowledge))
                .await
                .unwrap();
            assert_eq!(request.alarm_code(), Some("A0302"));
            let mut alarm = AlarmState::new("DL1", "A0302");
            alarm.activate(Utc::now());
            alarm.acknowledge(Utc::now());
            peer.send(&alarm.to_message(AlarmKind::Acknowledged)).await.unwrap();
        }
    );
    let reply = reply.unwrap();
    assert_eq!(reply.message_type(), MessageType::Alarm(AlarmKind::Acknowledged));
    let marker = peer.send_watchdog().await.unwrap();
    peer.expect_ack_of(marker.m_id().unwrap()).await.unwrap();
    remote.with_components(|registry| {
        assert!(registry.get("DL1").unwrap().alarm("A0302").unwrap().is_acknowledged());
    });

    supervisor.shutdown().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (supervisor, addr) = started(false).await;
    let _peer = site(addr, SITE_ID).await;
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();

    let result = remote
        .request_aggregated_status("TC", Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(RequestError::Collect(CollectError::Timeout))));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn wait_for_absent_site_times_out() {
    let (supervisor, _) = started(false).await;
    let result = supervisor
        .wait_for_site(SITE_ID, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(rsmp_proxy::ProxyError::Timeout(_))));
    supervisor.shutdown().await;
}
