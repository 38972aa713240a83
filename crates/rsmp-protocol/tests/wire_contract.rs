//! Wire contract tests: records written with `RecordCodec` and read back
//! through `Message::parse_attributes` + `Message::build` keep their
//! attributes and resolve to the same variant.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rsmp_protocol::{
    AlarmFields, AlarmKind, CommandArg, CommandReturn, Direction, Message, MessageType,
    RecordCodec, StatusItem, StatusRef, SubscribeItem,
};
use serde_json::json;
use tokio_util::codec::{FramedRead, FramedWrite};

fn sample_messages() -> Vec<Message> {
    let now = Utc::now();
    let watchdog = Message::watchdog(now);
    let alarm_fields = AlarmFields {
        active: true,
        suspended: false,
        acknowledged: false,
        category: "D".to_owned(),
        priority: 2,
        timestamp: now,
        return_values: vec![],
    };
    vec![
        Message::version(&["RN+SI0001".to_owned()], &["3.1.5".to_owned()], "1.2.1"),
        Message::ack_for(&watchdog).unwrap(),
        Message::not_ack_for(&watchdog, "because").unwrap(),
        watchdog,
        Message::aggregated_status("TC", [false, false, false, false, false, true, false, false], Some("NormalControl"), None, now),
        Message::aggregated_status_request("TC"),
        Message::alarm(AlarmKind::Issue, "DL1", "A0302", Some(&alarm_fields)),
        Message::alarm(AlarmKind::Acknowledge, "DL1", "A0302", None),
        Message::status_request("TC", &[StatusRef::new("S0001", "signalgroupstatus")]),
        Message::status_response(
            "TC",
            &[StatusItem {
                code: "S0001".to_owned(),
                name: "signalgroupstatus".to_owned(),
                value: json!("A1"),
                quality: Default::default(),
            }],
            now,
        ),
        Message::status_subscribe(
            "TC",
            &[SubscribeItem {
                code: "S0014".to_owned(),
                name: "status".to_owned(),
                update_rate: "0".to_owned(),
                send_on_change: Some(true),
            }],
        ),
        Message::status_unsubscribe("TC", &[StatusRef::new("S0014", "status")]),
        Message::command_request(
            "TC",
            &[CommandArg {
                code: "M0001".to_owned(),
                name: "status".to_owned(),
                operation: "setValue".to_owned(),
                value: json!("NormalControl"),
            }],
        ),
        Message::command_response(
            "TC",
            &[CommandReturn {
                code: "M0001".to_owned(),
                name: "status".to_owned(),
                value: json!("NormalControl"),
                age: "recent".to_owned(),
            }],
            now,
        ),
    ]
}

#[test]
fn every_variant_survives_build_from_wire_form() {
    for message in sample_messages() {
        let wire = message.to_json();
        let value = Message::parse_attributes(wire.as_bytes()).unwrap();
        let rebuilt = Message::build(value, wire.as_bytes()).unwrap();
        assert_eq!(rebuilt.message_type(), message.message_type(), "{wire}");
        assert_eq!(rebuilt.attributes(), message.attributes(), "{wire}");
        assert_eq!(rebuilt.to_json(), wire);
        assert_eq!(rebuilt.raw(), Some(wire.as_str()));
        assert_eq!(rebuilt.direction(), Some(Direction::In));
    }
}

#[tokio::test]
async fn records_cross_a_byte_stream_in_order() {
    let (client, server) = tokio::io::duplex(64);
    let messages = sample_messages();
    let expected: Vec<MessageType> = messages.iter().map(Message::message_type).collect();

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(client, RecordCodec::new());
        for message in messages {
            sink.send(message.to_json()).await.unwrap();
        }
    });

    let mut stream = FramedRead::new(server, RecordCodec::new());
    let mut received = Vec::new();
    while let Some(record) = stream.next().await {
        let record = record.unwrap();
        let value = Message::parse_attributes(&record).unwrap();
        received.push(Message::build(value, &record).unwrap().message_type());
    }
    writer.await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn stream_closed_mid_record_ends_cleanly() {
    use tokio::io::AsyncWriteExt;

    let (mut client, server) = tokio::io::duplex(256);
    client
        .write_all(b"{\"mType\":\"rSMsg\",\"type\":\"Watchdog\"}\x0c{\"mType\":\"rSM")
        .await
        .unwrap();
    drop(client);

    let mut stream = FramedRead::new(server, RecordCodec::new());
    assert!(stream.next().await.unwrap().is_ok());
    assert!(stream.next().await.is_none());
}
