use kubedoor::error::KubeDoorError;
use kubedoor::protocol::Frame;
use kubedoor::session::SessionMap;

// ══════════════════════════════════════════════════════════════════
// C1 gateway/session integration tests (no cluster, no coordinator
// process required)
//
// Exercises the full request/response correlation path a REST handler
// rides on: register a session, send a `Request` frame through
// `AgentSession::call`, simulate the agent's reply arriving back over
// the socket as a `Response` frame, and confirm the waiter resolves
// with the right body. Also covers the offline/duplicate-registration
// edges a gateway handler depends on to fail fast instead of hanging.
// ══════════════════════════════════════════════════════════════════

fn decode_request(raw: axum::extract::ws::Message) -> (u64, String, String, serde_json::Value) {
    let axum::extract::ws::Message::Text(text) = raw else {
        panic!("expected a text frame");
    };
    match serde_json::from_str::<Frame>(&text).unwrap() {
        Frame::Request { request_id, method, path, body, .. } => (request_id, method, path, body),
        other => panic!("expected a Request frame, got {other:?}"),
    }
}

#[tokio::test]
async fn forwarded_request_round_trips_through_response_frame() {
    let sessions = SessionMap::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let session = sessions.register("c1".into(), "1".into(), tx).await.unwrap();

    let body = serde_json::json!({ "namespace": "ns1", "deployment": "web", "num": 3 });
    let call_body = body.clone();
    let session_for_call = session.clone();
    let call = tokio::spawn(async move {
        session_for_call
            .call("POST", "/api/scale", serde_json::Value::Null, call_body)
            .await
    });

    // Stand in for the agent: read the forwarded Request frame off the
    // wire and answer it the way `dispatch_request` would.
    let sent = rx.recv().await.unwrap();
    let (request_id, method, path, forwarded_body) = decode_request(sent);
    assert_eq!(method, "POST");
    assert_eq!(path, "/api/scale");
    assert_eq!(forwarded_body, body);

    session
        .complete(request_id, 200, serde_json::json!({ "status": "ok" }))
        .await;

    let (status, resp_body) = call.await.unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(resp_body, serde_json::json!({ "status": "ok" }));
}

#[tokio::test]
async fn gateway_lookup_fails_closed_for_an_env_with_no_session() {
    let sessions = SessionMap::new();
    assert!(sessions.get("never-registered").await.is_none());
}

#[tokio::test]
async fn call_against_an_offline_session_fails_without_waiting_on_a_reply() {
    let sessions = SessionMap::new();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let session = sessions.register("c1".into(), "1".into(), tx).await.unwrap();
    sessions.mark_offline("c1").await;

    let err = session
        .call("POST", "/api/restart", serde_json::Value::Null, serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, KubeDoorError::SessionOffline(_)));
}

#[tokio::test]
async fn reconnecting_agent_can_replace_an_offline_session_for_the_same_env() {
    let sessions = SessionMap::new();
    let (tx1, _rx1) = tokio::sync::mpsc::unbounded_channel();
    sessions.register("c1".into(), "1".into(), tx1).await.unwrap();
    sessions.mark_offline("c1").await;

    let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
    let fresh = sessions.register("c1".into(), "1".into(), tx2).await.unwrap();
    assert!(fresh.is_online());
}

#[tokio::test]
async fn admis_request_and_response_frames_round_trip_through_serde() {
    let frame = Frame::AdmisRequest {
        request_id: 7,
        namespace: "ns1".into(),
        deployment: "web".into(),
    };
    let text = serde_json::to_string(&frame).unwrap();
    let decoded: Frame = serde_json::from_str(&text).unwrap();
    match decoded {
        Frame::AdmisRequest { request_id, namespace, deployment } => {
            assert_eq!(request_id, 7);
            assert_eq!(namespace, "ns1");
            assert_eq!(deployment, "web");
        }
        other => panic!("unexpected frame {other:?}"),
    }
}
