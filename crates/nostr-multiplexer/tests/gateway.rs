//! End-to-end tests: client -> gateway -> mock upstream relays.

mod common;

use common::{
    MockRelay, RelayScript, connect_client, envelope, next_frame, send, send_raw, start_gateway,
};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_req_event_then_eose() {
    let relay = MockRelay::start(RelayScript {
        events: vec![json!({"id": "e1", "kind": 1, "content": "hello"})],
        ..Default::default()
    })
    .await;
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    send(
        &mut client,
        envelope(&[relay.url.as_str()], json!(["REQ", "sub1", {"kinds": [1]}])),
    )
    .await;

    assert_eq!(
        next_frame(&mut client).await.unwrap(),
        envelope(
            &[relay.url.as_str()],
            json!(["EVENT", "sub1", {"id": "e1", "kind": 1, "content": "hello"}])
        )
    );
    assert_eq!(
        next_frame(&mut client).await.unwrap(),
        envelope(&[relay.url.as_str()], json!(["EOSE", "sub1"]))
    );

    // Filters reach the relay untouched, under a gateway-chosen id
    let req = relay.wait_for("REQ").await;
    assert_eq!(req[2], json!({"kinds": [1]}));
    assert_ne!(req[1], json!("sub1"));
}

#[tokio::test]
async fn test_duplicate_event_from_two_relays() {
    let script = RelayScript {
        events: vec![json!({"id": "e1", "kind": 1})],
        ..Default::default()
    };
    let a = MockRelay::start(script.clone()).await;
    let b = MockRelay::start(script).await;
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    send(
        &mut client,
        envelope(&[a.url.as_str(), b.url.as_str()], json!(["REQ", "sub1", {"kinds": [1]}])),
    )
    .await;

    let mut events = Vec::new();
    let mut eose_relays = Vec::new();
    while eose_relays.len() < 2 {
        let frame = next_frame(&mut client).await.unwrap();
        let relay = frame[0]["relays"][0].as_str().unwrap().to_string();
        match frame[1][0].as_str() {
            Some("EVENT") => events.push(relay),
            Some("EOSE") => eose_relays.push(relay),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    assert_eq!(events.len(), 1);
    eose_relays.sort();
    let mut expected = vec![a.url.clone(), b.url.clone()];
    expected.sort();
    assert_eq!(eose_relays, expected);
}

#[tokio::test]
async fn test_close_reaches_upstream() {
    let relay = MockRelay::start(RelayScript::default()).await;
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    send(&mut client, envelope(&[relay.url.as_str()], json!(["REQ", "s", {}]))).await;
    assert_eq!(next_frame(&mut client).await.unwrap()[1][0], "EOSE");

    send(&mut client, envelope(&[], json!(["CLOSE", "s"]))).await;
    let req = relay.wait_for("REQ").await;
    let close = relay.wait_for("CLOSE").await;
    assert_eq!(close[1], req[1]);
}

#[tokio::test]
async fn test_publish_acknowledged() {
    let relay = MockRelay::start(RelayScript {
        acknowledge: true,
        ..Default::default()
    })
    .await;
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    send(
        &mut client,
        envelope(&[relay.url.as_str()], json!(["EVENT", {"id": "e9", "kind": 1}])),
    )
    .await;

    assert_eq!(
        next_frame(&mut client).await.unwrap(),
        envelope(&[relay.url.as_str()], json!(["OK", "e9", true, ""]))
    );
}

#[tokio::test]
async fn test_count_reply_tagged() {
    let relay = MockRelay::start(RelayScript {
        count: 42,
        ..Default::default()
    })
    .await;
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    send(
        &mut client,
        envelope(&[relay.url.as_str()], json!(["COUNT", "c", {"kinds": [1]}])),
    )
    .await;

    assert_eq!(
        next_frame(&mut client).await.unwrap(),
        envelope(&[relay.url.as_str()], json!(["COUNT", "c", {"count": 42}]))
    );
}

#[tokio::test]
async fn test_unparsable_frame_gets_notice() {
    let relay = MockRelay::start(RelayScript::default()).await;
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    send_raw(&mut client, "this is not json").await;
    assert_eq!(
        next_frame(&mut client).await.unwrap(),
        json!([{"relays": []}, ["NOTICE", "", "Unable to parse message"]])
    );

    // Still open
    send(&mut client, envelope(&[relay.url.as_str()], json!(["REQ", "s", {}]))).await;
    assert_eq!(
        next_frame(&mut client).await.unwrap(),
        envelope(&[relay.url.as_str()], json!(["EOSE", "s"]))
    );
}

#[tokio::test]
async fn test_unknown_verb_gets_notice() {
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    send(&mut client, envelope(&[], json!(["HELLO"]))).await;
    assert_eq!(
        next_frame(&mut client).await.unwrap(),
        json!([{"relays": []}, ["NOTICE", "", "Unable to handle message"]])
    );
}

#[tokio::test]
async fn test_eleven_bad_frames_eject_client() {
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    for _ in 0..11 {
        send_raw(&mut client, "garbage").await;
    }

    let mut notices = 0;
    while let Some(frame) = next_frame(&mut client).await {
        assert_eq!(frame[1][0], "NOTICE");
        notices += 1;
    }
    assert_eq!(notices, 11);
}

#[tokio::test]
async fn test_ten_bad_frames_are_tolerated() {
    let relay = MockRelay::start(RelayScript::default()).await;
    let addr = start_gateway().await;
    let mut client = connect_client(addr).await;

    for _ in 0..10 {
        send_raw(&mut client, "garbage").await;
    }
    for _ in 0..10 {
        assert_eq!(next_frame(&mut client).await.unwrap()[1][0], "NOTICE");
    }

    send(&mut client, envelope(&[relay.url.as_str()], json!(["REQ", "s", {}]))).await;
    assert_eq!(next_frame(&mut client).await.unwrap()[1][0], "EOSE");
}
