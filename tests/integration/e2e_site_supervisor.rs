//! End-to-end: a site node and a supervisor node talking over loopback TCP.
//!
//! # Coverage
//! - Handshake and the site's initial aggregated status report.
//! - Status request, subscription and on-change updates.
//! - Command rejection for a component without a command handler.
//! - Alarm raised on the site, acknowledged from the supervisor.
//! - Site shutdown seen by the supervisor.

use std::net::SocketAddr;
use std::time::Duration;

use rsmp::ProxyState;
use rsmp::protocol::{AlarmKind, CommandArg, MessageType, StatusRef, SubscribeItem};
use rsmp::proxy::{AggregatedFlag, CollectError};
use serde_json::json;
use site::Site;
use supervisor::{RemoteSite, RequestError, Supervisor};

const SITE_ID: &str = "RN+SI0001";
const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_supervisor() -> (Supervisor, SocketAddr) {
    let config = supervisor::config::load_config_from_str(
        r#"
schema_version = 1
bind = "127.0.0.1:0"

[intervals]
timer = 0.02
watchdog = 0.2

[sites."RN+SI0001"]
"#,
    )
    .unwrap();
    let supervisor = Supervisor::new(config);
    let addr = supervisor.start().await.unwrap();
    (supervisor, addr)
}

fn site_config(addr: SocketAddr) -> site::config::SiteConfig {
    site::config::load_config_from_str(&format!(
        r#"
schema_version = 1
site_id = "{}"

[[supervisors]]
ip = "{}"
port = {}

[intervals]
timer = 0.02
watchdog = 0.2
reconnect = 30

[[components]]
id = "TC"
type = "main"

[[components]]
id = "SG1"
type = "signal_group"

[[statuses]]
component = "TC"
code = "S0001"
name = "signalgroupstatus"
value = "A1"

[[statuses]]
component = "TC"
code = "S0005"
name = "status"
value = false

[[alarms]]
component = "SG1"
code = "A0008"
category = "D"
priority = 2
"#,
        SITE_ID,
        addr.ip(),
        addr.port()
    ))
    .unwrap()
}

async fn connected_pair() -> (Supervisor, Site, RemoteSite) {
    let (supervisor, addr) = start_supervisor().await;
    let site = Site::new(site_config(addr));
    site.start();
    let remote = supervisor.wait_for_site(SITE_ID, WAIT).await.unwrap();
    (supervisor, site, remote)
}

/// Poll `check` until it holds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn site_reports_components_after_handshake() {
    let (supervisor, site, remote) = connected_pair().await;
    assert_eq!(remote.proxy().core_version().as_deref(), Some("3.2.2"));

    eventually("component reports", || {
        remote.with_components(|registry| registry.ids() == vec!["SG1".to_owned(), "TC".to_owned()])
    })
    .await;

    assert!(
        site.set_aggregated_status("TC", &[AggregatedFlag::LocalControl])
            .await
            .unwrap()
    );
    eventually("aggregated status change", || {
        remote.with_components(|registry| {
            registry
                .get("TC")
                .is_ok_and(|tc| tc.aggregated_status.is_set(AggregatedFlag::LocalControl))
        })
    })
    .await;

    let reply = remote.request_aggregated_status("SG1", WAIT).await.unwrap();
    assert_eq!(reply.message_type(), MessageType::AggregatedStatus);
    assert_eq!(reply.component_id(), Some("SG1"));

    site.shutdown().await;
    let mut states = remote.proxy().watch_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ProxyState::Stopped))
        .await
        .unwrap()
        .unwrap();
    supervisor.shutdown().await;
}

#[tokio::test]
async fn statuses_are_requested_and_subscribed() {
    let (supervisor, site, remote) = connected_pair().await;

    let values = remote
        .request_status(
            "TC",
            &[
                StatusRef::new("S0001", "signalgroupstatus"),
                StatusRef::new("S0005", "status"),
            ],
            WAIT,
        )
        .await
        .unwrap();
    assert_eq!(values[0].value, json!("A1"));
    assert_eq!(values[1].value, json!(false));

    let unknown = remote
        .request_status("TC", &[StatusRef::new("S0404", "missing")], WAIT)
        .await;
    assert!(matches!(
        unknown,
        Err(RequestError::Collect(CollectError::MessageRejected(_)))
    ));

    let first = remote
        .subscribe_to_status(
            "TC",
            &[SubscribeItem {
                code: "S0001".to_owned(),
                name: "signalgroupstatus".to_owned(),
                update_rate: "0".to_owned(),
                send_on_change: Some(true),
            }],
            Some(WAIT),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first[0].value, json!("A1"));

    site.set_status("TC", "S0001", "signalgroupstatus", json!("B2")).unwrap();
    eventually("status update", || {
        remote.with_components(|registry| {
            registry
                .get_status("TC", "S0001", "signalgroupstatus")
                .is_ok_and(|s| s.value == json!("B2"))
        })
    })
    .await;

    site.shutdown().await;
    supervisor.shutdown().await;
}

#[tokio::test]
async fn command_without_handler_is_rejected() {
    let (supervisor, site, remote) = connected_pair().await;
    let result = remote
        .send_command(
            "TC",
            &[CommandArg {
                code: "M0001".to_owned(),
                name: "status".to_owned(),
                operation: "setValue".to_owned(),
                value: json!("YellowFlash"),
            }],
            WAIT,
        )
        .await;
    match result {
        Err(RequestError::Collect(CollectError::MessageRejected(reason))) => {
            assert!(reason.contains("M0001"), "reason: {}", reason);
        }
        other => panic!("expected rejection, got {:?}", other.map(|r| r.len())),
    }
    site.shutdown().await;
    supervisor.shutdown().await;
}

#[tokio::test]
async fn site_alarm_is_acknowledged_by_supervisor() {
    let (supervisor, site, remote) = connected_pair().await;

    assert!(site.activate_alarm("SG1", "A0008").await.unwrap());
    eventually("alarm issue", || {
        remote.with_components(|registry| {
            registry
                .get("SG1")
                .ok()
                .and_then(|c| c.alarm("A0008").map(|a| a.is_active()))
                .unwrap_or(false)
        })
    })
    .await;

    let reply = remote.acknowledge_alarm("SG1", "A0008", WAIT).await.unwrap();
    assert_eq!(reply.message_type(), MessageType::Alarm(AlarmKind::Acknowledged));
    assert!(site.alarm("SG1", "A0008").unwrap().is_acknowledged());

    let suspended = remote.suspend_alarm("SG1", "A0008", WAIT).await.unwrap();
    assert_eq!(suspended.message_type(), MessageType::Alarm(AlarmKind::Suspended));
    let resumed = remote.resume_alarm("SG1", "A0008", WAIT).await.unwrap();
    assert_eq!(resumed.message_type(), MessageType::Alarm(AlarmKind::Resumed));
    assert!(!site.alarm("SG1", "A0008").unwrap().is_suspended());

    site.shutdown().await;
    supervisor.shutdown().await;
}
