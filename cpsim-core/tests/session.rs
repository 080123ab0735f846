mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Behavior, FakeConnector, SECRET, derived_identities, script, secs, settings};
use cpsim_core::{
    ChargingSessionTemplate, ErrorKind, SessionScript, SessionSettings, SessionTimings,
    VirtualClientSession,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

fn session(
    connector: &FakeConnector,
    script: Arc<SessionScript>,
    settings: Arc<SessionSettings>,
) -> VirtualClientSession {
    VirtualClientSession::new(
        derived_identities().identity_for(1),
        script,
        Arc::new(connector.clone()),
        settings,
    )
}

fn charging_script(timings: SessionTimings, malformed_authorize: bool) -> Arc<SessionScript> {
    let template = ChargingSessionTemplate {
        timings,
        malformed_authorize,
        ..ChargingSessionTemplate::default()
    };
    Arc::new(
        template
            .build()
            .unwrap_or_else(|e| panic!("template: {e}")),
    )
}

fn parse(frame: &str) -> Value {
    serde_json::from_str(frame).unwrap_or_else(|e| panic!("frame `{frame}` is not json: {e}"))
}

#[tokio::test(start_paused = true)]
async fn charging_session_sends_every_call_in_order_then_closes() {
    let connector = FakeConnector::new(Behavior::Accept);
    let outcome = session(&connector, charging_script(SessionTimings::default(), false), settings())
        .execute(CancellationToken::new())
        .await;

    assert!(outcome.is_complete(), "unexpected outcome: {outcome:?}");
    assert_eq!(outcome.charge_point_id, "cs001");
    assert_eq!(outcome.steps_completed, 11);
    assert_eq!(outcome.total_steps, 11);
    assert!(outcome.connect_established);

    let connects = connector.wire.connects.lock().clone();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].url, "ws://csms.test/ws/cs001");
    assert_eq!(connects[0].subprotocol, "ocpp1.6");
    assert_eq!(
        connects[0].authorization,
        "Basic Y3MwMDE6ZmlkZGxlc3RpY2tzX2Zpc2hzdGlja3M="
    );

    let frames = connector.wire.frames_for("ws://csms.test/ws/cs001");
    let expected = [
        "BootNotification",
        "StatusNotification",
        "Heartbeat",
        "Heartbeat",
        "Heartbeat",
        "Authorize",
        "StartTransaction",
        "MeterValues",
        "MeterValues",
        "StopTransaction",
    ];
    assert_eq!(frames.len(), expected.len());
    for (i, (frame, action)) in frames.iter().zip(expected).enumerate() {
        let v = parse(frame);
        assert_eq!(v[0], json!(2));
        assert_eq!(v[1], json!((i + 1).to_string()));
        assert_eq!(v[2], json!(action));
    }

    let calls: Vec<_> = outcome.calls.iter().map(|c| c.call_id.as_str()).collect();
    assert_eq!(calls, ["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"]);
    assert_eq!(connector.wire.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn step_delays_pace_the_session() {
    let connector = FakeConnector::new(Behavior::Accept);
    let s = script(
        cpsim_core::SessionScript::builder()
            .call("BootNotification", json!({}))
            .call_after(secs(30), "Heartbeat", json!({}))
            .close_after(secs(5)),
    );

    let outcome = session(&connector, s, settings())
        .execute(CancellationToken::new())
        .await;

    assert!(outcome.is_complete());
    assert_eq!(outcome.calls[0].sent_at, Duration::ZERO);
    assert_eq!(outcome.calls[1].sent_at, secs(30));
    assert_eq!(outcome.duration, secs(35));
}

#[tokio::test(start_paused = true)]
async fn malformed_authorize_is_sent_verbatim() {
    let connector = FakeConnector::new(Behavior::Accept);
    let outcome = session(&connector, charging_script(SessionTimings::default(), true), settings())
        .execute(CancellationToken::new())
        .await;

    assert!(outcome.is_complete());
    let frames = connector.wire.frames_for("ws://csms.test/ws/cs001");
    let authorize = &frames[5];
    assert!(authorize.starts_with(r#"[2,"6","Authorize",[2, "8", "Authorize", {"idTag": "#));
    assert!(serde_json::from_str::<Value>(authorize).is_err());
    // The session keeps going after the malformed frame.
    assert_eq!(parse(&frames[6])[2], json!("StartTransaction"));
}

#[tokio::test(start_paused = true)]
async fn rejected_upgrade_is_a_connect_failure_with_no_steps() {
    let connector = FakeConnector::new(Behavior::Reject(401));
    let outcome = session(&connector, charging_script(SessionTimings::default(), false), settings())
        .execute(CancellationToken::new())
        .await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::ConnectFailure));
    assert!(!outcome.connect_established);
    assert_eq!(outcome.steps_completed, 0);
    assert!(outcome.connect_latency.is_none());
    assert!(connector.wire.frames.lock().is_empty());
    assert_eq!(connector.wire.close_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_send_stops_the_script_and_closes_once() {
    let connector = FakeConnector::new(Behavior::FailSend(3));
    let outcome = session(&connector, charging_script(SessionTimings::default(), false), settings())
        .execute(CancellationToken::new())
        .await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::TransmitFailure));
    assert_eq!(outcome.steps_completed, 2);
    assert_eq!(outcome.calls.len(), 2);
    assert_eq!(connector.wire.frames.lock().len(), 2);
    assert_eq!(connector.wire.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn session_timeout_still_closes_the_connection() {
    let connector = FakeConnector::new(Behavior::Accept);
    let s = script(
        cpsim_core::SessionScript::builder()
            .call("BootNotification", json!({}))
            .call_after(secs(60), "Heartbeat", json!({}))
            .close(),
    );
    let settings = Arc::new(
        SessionSettings::new("ws://csms.test/ws")
            .unwrap_or_else(|e| panic!("{e}"))
            .with_session_timeout(Some(secs(10))),
    );

    let outcome = session(&connector, s, settings)
        .execute(CancellationToken::new())
        .await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(outcome.steps_completed, 1);
    assert_eq!(outcome.duration, secs(10));
    assert_eq!(connector.wire.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_connect_counts_against_the_session_timeout() {
    let connector = FakeConnector::new(Behavior::SlowConnect(secs(30)));
    let settings = Arc::new(
        SessionSettings::new("ws://csms.test/ws")
            .unwrap_or_else(|e| panic!("{e}"))
            .with_session_timeout(Some(secs(5))),
    );

    let outcome = session(&connector, charging_script(SessionTimings::default(), false), settings)
        .execute(CancellationToken::new())
        .await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
    assert!(!outcome.connect_established);
    assert_eq!(outcome.steps_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_a_delay_reports_progress_so_far() {
    let connector = FakeConnector::new(Behavior::Accept);
    let s = script(
        cpsim_core::SessionScript::builder()
            .call("BootNotification", json!({}))
            .call_after(secs(20), "Heartbeat", json!({}))
            .close(),
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(secs(5)).await;
        canceller.cancel();
    });

    let outcome = session(&connector, s, settings()).execute(token).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!(outcome.steps_completed, 1);
    assert_eq!(outcome.duration, secs(5));
    assert_eq!(connector.wire.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn shared_secret_is_used_for_every_identity() {
    let connector = FakeConnector::new(Behavior::Accept);
    let identities = derived_identities();
    let s = script(cpsim_core::SessionScript::builder().call("Heartbeat", json!({})).close());

    for idx in [1, 42] {
        let outcome = VirtualClientSession::new(
            identities.identity_for(idx),
            s.clone(),
            Arc::new(connector.clone()),
            settings(),
        )
        .execute(CancellationToken::new())
        .await;
        assert!(outcome.is_complete());
    }

    let connects = connector.wire.connects.lock().clone();
    assert_eq!(connects[1].url, "ws://csms.test/ws/cs042");
    assert_eq!(
        connects[1].authorization,
        format!("Basic {}", cpsim_core::encode_credential("cs042", SECRET))
    );
}
