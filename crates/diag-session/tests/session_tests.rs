//! End-to-end session tests over the scripted mock transport and, for
//! the transport layer itself, an in-process DoIP gateway on a real
//! TCP socket.

use std::sync::Arc;
use std::time::Duration;

use diag_session::{
    ConnectionParameters, MockBehaviour, MockTransport, SequenceScript, SessionCore, SessionError,
    SessionEvent, SessionState,
};
use doip_codec::{DoipFrame, NegativeResponseCode};

fn test_params(tester_present: bool) -> ConnectionParameters {
    ConnectionParameters {
        remote_ip: "127.0.0.1".into(),
        remote_port: 13400,
        vendor: "test".into(),
        protocol_version: 0x02,
        tester_addr: 0x0E80,
        ecu_addr: 0x0001,
        sga_addr: 0x0E00,
        activation_code: 0x00,
        tester_present,
        tester_present_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(5),
        activation_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(5),
    }
}

fn mock_session(tester_present: bool) -> (SessionCore, MockTransport) {
    let mock = MockTransport::new();
    let session =
        SessionCore::with_transport(test_params(tester_present), Arc::new(mock.clone())).unwrap();
    (session, mock)
}

#[tokio::test]
async fn connect_disconnect_lifecycle() {
    let (session, _mock) = mock_session(false);
    let mut events = session.subscribe();

    assert_eq!(session.state(), SessionState::Disconnected);
    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert!(matches!(events.recv().await, Ok(SessionEvent::Connected)));

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.pending_requests(), 0);
    assert!(!session.keepalive_running().await);
    assert!(matches!(events.recv().await, Ok(SessionEvent::Disconnected)));
}

#[tokio::test]
async fn disconnect_when_disconnected_is_ok() {
    let (session, _mock) = mock_session(false);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn double_connect_is_rejected() {
    let (session, _mock) = mock_session(false);
    session.connect().await.unwrap();
    assert!(matches!(
        session.connect().await,
        Err(SessionError::AlreadyConnected)
    ));
}

#[tokio::test]
async fn send_before_connect_writes_nothing() {
    let (session, mock) = mock_session(false);
    assert!(matches!(
        session.send_uds(&[0x10, 0x01]).await,
        Err(SessionError::NotConnected)
    ));
    assert!(mock.sent_frames().is_empty());
}

#[tokio::test]
async fn connect_failure_returns_to_disconnected() {
    let mock = MockTransport::with_behaviour(MockBehaviour {
        refuse_connection: true,
        ..Default::default()
    });
    let session = SessionCore::with_transport(test_params(false), Arc::new(mock)).unwrap();
    assert!(matches!(
        session.connect().await,
        Err(SessionError::Connection(_))
    ));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn activation_denial_fails_connect() {
    let mock = MockTransport::with_behaviour(MockBehaviour {
        deny_activation: Some(0x06),
        ..Default::default()
    });
    let session = SessionCore::with_transport(test_params(false), Arc::new(mock)).unwrap();
    assert!(matches!(
        session.connect().await,
        Err(SessionError::ActivationFailed(_))
    ));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn uds_request_gets_correlated_response() {
    let (session, mock) = mock_session(false);
    mock.respond(&[0x10, 0x01], &[0x50, 0x01, 0x00, 0x19, 0x01, 0xF4]);
    session.connect().await.unwrap();

    let response = session.send_uds_text("10 01").await.unwrap().unwrap();
    assert_eq!(response.raw, vec![0x50, 0x01, 0x00, 0x19, 0x01, 0xF4]);
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn suppressed_request_awaits_no_response() {
    let (session, mock) = mock_session(false);
    session.connect().await.unwrap();

    let response = session.send_uds(&[0x3E, 0x80]).await.unwrap();
    assert!(response.is_none());
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(mock.sent_uds(), vec![vec![0x3E, 0x80]]);
}

#[tokio::test]
async fn doip_diagnostic_payload_is_correlated() {
    let (session, mock) = mock_session(false);
    mock.respond(&[0x10, 0x01], &[0x50, 0x01, 0x00, 0x19, 0x01, 0xF4]);
    session.connect().await.unwrap();

    let response = session
        .send_doip(0x8001, vec![0x10, 0x01])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.raw, vec![0x50, 0x01, 0x00, 0x19, 0x01, 0xF4]);
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(mock.sent_uds(), vec![vec![0x10, 0x01]]);
}

#[tokio::test]
async fn doip_raw_payload_awaits_no_reply() {
    let (session, mock) = mock_session(false);
    session.connect().await.unwrap();

    let response = session
        .send_doip(0x0007, vec![0x0E, 0x80])
        .await
        .unwrap();
    assert!(response.is_none());
    assert_eq!(session.pending_requests(), 0);
    assert!(mock.sent_frames().iter().any(|f| matches!(
        f,
        DoipFrame::Other {
            payload_type: 0x0007,
            ..
        }
    )));
}

#[tokio::test]
async fn doip_before_connect_writes_nothing() {
    let (session, mock) = mock_session(false);
    assert!(matches!(
        session.send_doip(0x0007, vec![]).await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        session.send_doip(0x8001, vec![0x10, 0x01]).await,
        Err(SessionError::NotConnected)
    ));
    assert!(mock.sent_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_ecu_times_out_and_clears_pending() {
    let mock = MockTransport::with_behaviour(MockBehaviour {
        silent: true,
        ..Default::default()
    });
    let session = SessionCore::with_transport(test_params(false), Arc::new(mock)).unwrap();
    session.connect().await.unwrap();

    assert!(matches!(
        session.send_uds(&[0x10, 0x01]).await,
        Err(SessionError::RequestTimeout)
    ));
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn security_access_with_zero_seed() {
    let (session, mock) = mock_session(false);
    mock.respond(&[0x27, 0x01], &[0x67, 0x01, 0x00, 0x00]);
    session.connect().await.unwrap();

    session.security_access(1, &[]).await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    // No key request should follow a zero seed
    assert_eq!(mock.sent_uds(), vec![vec![0x27, 0x01]]);
}

#[tokio::test]
async fn security_access_seed_key_roundtrip() {
    let (session, mock) = mock_session(false);
    mock.respond(&[0x27, 0x01], &[0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]);
    mock.respond(&[0x27, 0x02, 0x11, 0x22, 0x33, 0x44], &[0x67, 0x02]);
    session.connect().await.unwrap();

    session
        .security_access(1, &[0x11, 0x22, 0x33, 0x44])
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    let security = session.security_state();
    assert_eq!(security.last_seed, Some(vec![0xAA, 0xBB, 0xCC, 0xDD]));
    assert_eq!(security.attempts, 0);
}

#[tokio::test]
async fn invalid_key_keeps_session_connected() {
    let (session, mock) = mock_session(false);
    mock.respond(&[0x27, 0x01], &[0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]);
    mock.respond(&[0x27, 0x02, 0xDE, 0xAD, 0xBE, 0xEF], &[0x7F, 0x27, 0x35]);
    session.connect().await.unwrap();

    let result = session.security_access(1, &[0xDE, 0xAD, 0xBE, 0xEF]).await;
    assert!(matches!(
        result,
        Err(SessionError::NegativeResponse {
            service_id: 0x27,
            nrc: NegativeResponseCode::InvalidKey,
        })
    ));
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.security_state().attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn keepalive_sends_at_configured_cadence() {
    let (session, mock) = mock_session(true);
    session.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1050)).await;
    session.disconnect().await.unwrap();

    let tester_present = |frames: &[Vec<u8>]| {
        frames
            .iter()
            .filter(|p| p.as_slice() == [0x3E, 0x80])
            .count()
    };
    let count = tester_present(&mock.sent_uds());
    assert!((9..=11).contains(&count), "got {count} keep-alive frames");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(tester_present(&mock.sent_uds()), count);
}

#[tokio::test(start_paused = true)]
async fn tester_present_toggle_at_runtime() {
    let (session, mock) = mock_session(false);
    session.connect().await.unwrap();
    assert!(!session.keepalive_running().await);

    session
        .trigger_tester_present(true, Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(session.keepalive_running().await);
    tokio::time::sleep(Duration::from_millis(650)).await;

    session.trigger_tester_present(false, None).await.unwrap();
    let count = mock.sent_uds().len();
    assert!((2..=4).contains(&count), "got {count}");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(mock.sent_uds().len(), count);
}

#[tokio::test]
async fn connection_loss_fails_pending_and_notifies() {
    let (session, mock) = mock_session(false);
    session.connect().await.unwrap();
    let mut events = session.subscribe();

    mock.drop_connection();
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::ConnectionLost { .. } => break,
            _ => continue,
        }
    }
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn connection_loss_stops_keepalive() {
    let (session, mock) = mock_session(true);
    session.connect().await.unwrap();
    assert!(session.keepalive_running().await);
    let mut events = session.subscribe();

    mock.drop_connection();
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::ConnectionLost { .. } => break,
            _ => continue,
        }
    }
    assert!(!session.keepalive_running().await);

    // A fresh connect gets a fresh keep-alive task
    session.connect().await.unwrap();
    assert!(session.keepalive_running().await);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn sequence_stops_at_first_failure() {
    let (session, mock) = mock_session(false);
    mock.respond(&[0x22, 0xF1, 0x90], &[0x7F, 0x22, 0x31]);
    let script = SequenceScript::from_json_str(
        r#"{
            "sequence": [
                { "name": "open", "action": "connect" },
                { "name": "session", "action": "10 01", "expect": "50 01*" },
                { "name": "read vin", "action": "22 F1 90" },
                { "name": "reset", "action": "11 01" }
            ],
            "fail_handler": [
                { "name": "cleanup", "action": "disconnect" }
            ]
        }"#,
    )
    .unwrap();
    session.load_sequence(script);

    let result = session.execute_sequence().await;
    match result {
        Err(SessionError::Sequence { step, name, .. }) => {
            assert_eq!(step, 2);
            assert_eq!(name, "read vin");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let sent = mock.sent_uds();
    assert!(sent.contains(&vec![0x10, 0x01]));
    assert!(sent.contains(&vec![0x22, 0xF1, 0x90]));
    assert!(!sent.contains(&vec![0x11, 0x01]), "step after failure ran");
    // Fail handler disconnected the session
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn sequence_step_timeout_skips_remaining_steps() {
    let (session, mock) = mock_session(false);
    mock.ignore(&[0x22, 0xF1, 0x90]);
    let script = SequenceScript::from_json_str(
        r#"{
            "sequence": [
                { "name": "open", "action": "connect" },
                { "name": "session", "action": "10 01" },
                { "name": "read vin", "action": "22 F1 90", "timeout": "200ms" },
                { "name": "reset", "action": "11 01" }
            ]
        }"#,
    )
    .unwrap();
    session.load_sequence(script);

    match session.execute_sequence().await {
        Err(SessionError::Sequence { step, source, .. }) => {
            assert_eq!(step, 2);
            assert!(matches!(*source, SessionError::RequestTimeout));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!mock.sent_uds().contains(&vec![0x11, 0x01]));
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn wait_step_outlasting_default_timeout_completes() {
    let (session, mock) = mock_session(false);
    let script = SequenceScript::from_json_str(
        r#"{
            "sequence": [
                { "name": "open", "action": "connect" },
                { "name": "settle", "action": "wait 6s" },
                { "name": "session", "action": "10 01" }
            ]
        }"#,
    )
    .unwrap();
    session.load_sequence(script);

    session.execute_sequence().await.unwrap();
    assert_eq!(mock.sent_uds(), vec![vec![0x10, 0x01]]);
}

#[tokio::test]
async fn sequence_completes_and_sends_all_steps() {
    let (session, mock) = mock_session(false);
    let script = SequenceScript::from_json_str(
        r#"{
            "sequence": [
                { "name": "open", "action": "connect" },
                { "name": "session", "action": "10 03", "expect": "50 03*" },
                { "name": "reads", "action": ["22 F1 90", "22 F1 20"] },
                { "name": "close", "action": "disconnect" }
            ]
        }"#,
    )
    .unwrap();
    session.load_sequence(script);

    session.execute_sequence().await.unwrap();
    assert_eq!(
        mock.sent_uds(),
        vec![
            vec![0x10, 0x03],
            vec![0x22, 0xF1, 0x90],
            vec![0x22, 0xF1, 0x20]
        ]
    );
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn cancelled_sequence_stops_at_step_boundary() {
    let (session, mock) = mock_session(false);
    let script = SequenceScript::from_json_str(
        r#"{
            "sequence": [
                { "name": "open", "action": "connect" },
                { "name": "settle", "action": "wait 500ms" },
                { "name": "session", "action": "10 01" }
            ]
        }"#,
    )
    .unwrap();
    session.load_sequence(script);

    let session = Arc::new(session);
    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.execute_sequence().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.cancel_sequence();

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(SessionError::Cancelled)));
    assert!(mock.sent_uds().is_empty(), "step after cancel ran");
}

#[tokio::test]
async fn flash_requires_authenticated_session() {
    let (session, _mock) = mock_session(false);
    session.connect().await.unwrap();
    assert!(matches!(
        session.flash().await,
        Err(SessionError::Flash(_))
    ));
}

#[tokio::test]
async fn flash_runs_vbf_download() {
    use std::io::Write;

    use diag_session::{FlashSet, VbfFlashDriver};

    let (session, mock) = mock_session(false);
    mock.respond(&[0x27, 0x01], &[0x67, 0x01, 0x00]);
    mock.respond_prefix(
        &[0x31, 0x01, 0x02, 0x12],
        &[0x71, 0x01, 0x02, 0x12, 0x10, 0x00],
    );
    session.connect().await.unwrap();
    session.security_access(1, &[]).await.unwrap();

    let header = "header {\n\
        sw_part_number = \"32336593 AA\";\n\
        sw_version = \"A\";\n\
        ecu_address = 0x1A01;\n\
        erase = { { 0x00010000, 0x00000010 } };\n\
        sw_signature_dev = 0x11223344;\n\
        file_checksum = 0xDEADBEEF;\n}";
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(header.as_bytes()).unwrap();
    file.write_all(&0x00010000u32.to_be_bytes()).unwrap();
    file.write_all(&16u32.to_be_bytes()).unwrap();
    file.write_all(&[0xA5; 16]).unwrap();
    file.write_all(&[0x00, 0x00]).unwrap();
    file.flush().unwrap();

    session.load_flash_set(FlashSet::load(&[file.path()]).unwrap());
    session.set_flash_driver(Arc::new(VbfFlashDriver::default()));
    session.flash().await.unwrap();

    let sent = mock.sent_uds();
    assert!(sent.iter().any(|p| p.starts_with(&[0x31, 0x01, 0xFF, 0x00])));
    assert!(sent.iter().any(|p| p.starts_with(&[0x34, 0x00, 0x44])));
    assert!(sent.iter().any(|p| p.starts_with(&[0x36, 0x01, 0xA5])));
    assert!(sent.contains(&vec![0x37]));
    assert!(sent.iter().any(|p| p
        .starts_with(&[0x31, 0x01, 0x02, 0x12, 0x11, 0x22, 0x33, 0x44])));
}

mod gateway {
    //! A minimal in-process DoIP gateway for exercising the real TCP
    //! transport: accepts routing activation and answers every UDS
    //! request positively.

    use std::net::SocketAddr;

    use doip_codec::{ActivationResult, DoipFrame, FrameDecoder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    pub async fn spawn() -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                while let Some(frame) = decoder.next_frame().unwrap() {
                    let reply = match frame {
                        DoipFrame::RoutingActivationRequest { source_address, .. } => {
                            Some(DoipFrame::RoutingActivationResponse {
                                tester_address: source_address,
                                entity_address: 0x0E00,
                                result: ActivationResult::Success,
                            })
                        }
                        DoipFrame::Diagnostic {
                            source_address,
                            target_address,
                            payload,
                        } => {
                            let mut uds = vec![payload[0].wrapping_add(0x40)];
                            uds.extend_from_slice(&payload[1..]);
                            Some(DoipFrame::diagnostic(target_address, source_address, uds))
                        }
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        let bytes = reply.encode(0x02).unwrap();
                        stream.write_all(&bytes).await.unwrap();
                    }
                }
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => decoder.extend(&buf[..n]),
                }
            }
        });
        (addr, handle)
    }
}

#[tokio::test]
async fn tcp_transport_against_in_process_gateway() {
    let (addr, gateway) = gateway::spawn().await;

    let mut params = test_params(false);
    params.remote_ip = addr.ip().to_string();
    params.remote_port = addr.port();

    let session = SessionCore::new(params).unwrap();
    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    let response = session.send_uds(&[0x22, 0xF1, 0x90]).await.unwrap().unwrap();
    assert_eq!(response.raw, vec![0x62, 0xF1, 0x90]);

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    gateway.abort();
}
