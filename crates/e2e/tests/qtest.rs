//! qtest end-to-end scenarios against the mock server.

use std::sync::{Arc, Mutex};

use qlink_e2e::server::memory_responder;
use qlink_e2e::{init_tracing, wait_until, QtestServer, ServerOp};
use qlink_protocol::{Endianness, Error, Qtest, QtestClient, State};

#[tokio::test]
async fn qtest_replies_match_issue_order() {
    init_tracing();
    let server = QtestServer::spawn(|req| {
        assert_eq!(req[0], "probe");
        vec![ServerOp::Send(format!("OK {}", req[1]))]
    })
    .await
    .unwrap();

    let qtest = QtestClient::new();
    qtest.connect(&server.address).await.unwrap();

    // Schedule all three before awaiting any of them.
    let (a, b, c) = tokio::join!(
        qtest.execute("probe", &["1"]),
        qtest.execute("probe", &["2"]),
        qtest.execute("probe", &["3"]),
    );
    assert_eq!(a.unwrap(), ["1"]);
    assert_eq!(b.unwrap(), ["2"]);
    assert_eq!(c.unwrap(), ["3"]);

    qtest.disconnect().await;
}

#[tokio::test]
async fn qtest_irq_messages_bypass_the_response_fifo() {
    init_tracing();
    let server = QtestServer::spawn(|_req| {
        vec![
            ServerOp::Send("IRQ raise 0".to_string()),
            ServerOp::Send("OK".to_string()),
            ServerOp::Send("IRQ lower 0".to_string()),
        ]
    })
    .await
    .unwrap();

    let qtest = QtestClient::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    qtest
        .on_event(move |msg| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(msg);
            }
        })
        .await;

    qtest.connect(&server.address).await.unwrap();

    let reply = qtest.execute("irq_intercept_in", &["/machine"]).await.unwrap();
    assert!(reply.is_empty());

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ["IRQ", "raise", "0"]);
        assert_eq!(seen[1], ["IRQ", "lower", "0"]);
    }

    qtest.disconnect().await;
}

#[tokio::test]
async fn qtest_memory_round_trips() {
    init_tracing();
    let server = QtestServer::spawn(memory_responder(8192)).await.unwrap();

    let client = QtestClient::new();
    client.connect(&server.address).await.unwrap();
    let qtest = Qtest::new(client);

    // Hex transfer, including the empty write.
    for len in [0usize, 1, 11, 4096] {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        qtest.write(64, &data).await.unwrap();
        assert_eq!(qtest.read(64, len).await.unwrap(), data);
    }

    // Base64 transfer.
    for len in [1usize, 11, 4096] {
        let data: Vec<u8> = (0..len).map(|i| (i % 13) as u8).collect();
        qtest.b64write(128, &data).await.unwrap();
        assert_eq!(qtest.b64read(128, len).await.unwrap(), data);
    }

    // Hex write is visible through base64 read and vice versa.
    qtest.write(0, b"hello world").await.unwrap();
    assert_eq!(qtest.b64read(0, 11).await.unwrap(), b"hello world");

    qtest.memset(0, 16, 0xaa).await.unwrap();
    assert_eq!(qtest.read(0, 16).await.unwrap(), vec![0xaa; 16]);

    assert_eq!(qtest.endianness().await.unwrap(), Endianness::Little);

    qtest.client().disconnect().await;
}

#[tokio::test]
async fn qtest_fail_reply_is_a_command_error() {
    init_tracing();
    let server = QtestServer::spawn(|req| {
        assert_eq!(req[0], "module_load");
        vec![ServerOp::Send("FAIL No module named block-iscsi".to_string())]
    })
    .await
    .unwrap();

    let client = QtestClient::new();
    client.connect(&server.address).await.unwrap();
    let qtest = Qtest::new(client);

    let err = qtest.module_load("block-", "iscsi").await.unwrap_err();
    match err {
        Error::Qtest { status, reason } => {
            assert_eq!(status, "FAIL");
            assert_eq!(reason, "No module named block-iscsi");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // Command failures do not end the session.
    assert!(qtest.client().running());
    qtest.client().disconnect().await;
}

#[tokio::test]
async fn qtest_unknown_status_leaves_the_session_running() {
    init_tracing();
    let mut first = true;
    let server = QtestServer::spawn(move |_req| {
        let line = if first {
            first = false;
            "WAT really".to_string()
        } else {
            "OK done".to_string()
        };
        vec![ServerOp::Send(line)]
    })
    .await
    .unwrap();

    let qtest = QtestClient::new();
    qtest.connect(&server.address).await.unwrap();

    let err = qtest.execute("poke", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(qtest.running());

    assert_eq!(qtest.execute("poke", &[]).await.unwrap(), ["done"]);

    qtest.disconnect().await;
}

#[tokio::test]
async fn qtest_unsolicited_response_fails_the_session() {
    init_tracing();
    let server = QtestServer::spawn(|_req| {
        vec![
            ServerOp::Send("OK".to_string()),
            ServerOp::Send("OK nobody-asked".to_string()),
        ]
    })
    .await
    .unwrap();

    let qtest = QtestClient::new();
    qtest.connect(&server.address).await.unwrap();

    qtest.execute("poke", &[]).await.unwrap();

    wait_until(|| !qtest.running()).await;
    let cause = qtest.disconnect_cause().expect("cause missing");
    assert!(matches!(&*cause, Error::Protocol(_)));

    qtest.disconnect().await;
    assert_eq!(qtest.state(), State::Idle);
}

#[tokio::test]
async fn qtest_peer_close_cancels_pending_requests() {
    init_tracing();
    let server = QtestServer::spawn(|_req| vec![ServerOp::Close]).await.unwrap();

    let qtest = QtestClient::new();
    qtest.connect(&server.address).await.unwrap();

    let (a, b) = tokio::join!(qtest.execute("poke", &[]), qtest.execute("poke", &[]));
    assert!(matches!(a.unwrap_err(), Error::Disconnected(_)));
    assert!(matches!(b.unwrap_err(), Error::Disconnected(_)));

    // Teardown is still pending until disconnect() is called.
    assert!(qtest.disconnecting());
    let err = qtest.execute("poke", &[]).await.unwrap_err();
    assert!(matches!(err, Error::State(_)));

    qtest.disconnect().await;
    assert_eq!(qtest.state(), State::Idle);
}

#[tokio::test]
async fn qtest_execute_in_idle_is_a_state_error() {
    init_tracing();
    let qtest = QtestClient::new();
    let err = qtest.execute("poke", &[]).await.unwrap_err();
    assert!(matches!(err, Error::State(_)));
}

#[tokio::test]
async fn qtest_typed_port_and_clock_verbs() {
    init_tracing();
    let server = QtestServer::spawn(|req| {
        let line = match req[0].as_str() {
            "inb" => {
                assert_eq!(req[1], "1016");
                "OK 0xff".to_string()
            }
            "outb" => {
                assert_eq!(req[1..], ["1016", "170"]);
                "OK".to_string()
            }
            "readq" => "OK 0xdeadbeefcafe".to_string(),
            "endianness" => "OK big".to_string(),
            "clock_step" => {
                assert_eq!(req[1], "1000000");
                "OK 1000000".to_string()
            }
            "clock_set" => "OK 2000000".to_string(),
            "set_irq_in" => {
                assert_eq!(req[1..], ["/machine", "sirq", "3", "1"]);
                "OK".to_string()
            }
            other => format!("FAIL unknown verb {}", other),
        };
        vec![ServerOp::Send(line)]
    })
    .await
    .unwrap();

    let client = QtestClient::new();
    client.connect(&server.address).await.unwrap();
    let qtest = Qtest::new(client);

    assert_eq!(qtest.inb(1016).await.unwrap(), 0xff);
    qtest.outb(1016, 170).await.unwrap();
    assert_eq!(qtest.readq(0).await.unwrap(), 0xdead_beef_cafe);
    assert_eq!(qtest.endianness().await.unwrap(), Endianness::Big);
    assert_eq!(qtest.clock_step(Some(1_000_000)).await.unwrap(), 1_000_000);
    assert_eq!(qtest.clock_set(2_000_000).await.unwrap(), 2_000_000);
    qtest.set_irq_in("/machine", "sirq", 3, 1).await.unwrap();

    qtest.client().disconnect().await;
}

#[tokio::test]
async fn qtest_rtas_return_codes() {
    init_tracing();
    let mut calls = 0;
    let server = QtestServer::spawn(move |req| {
        assert_eq!(req[0], "rtas");
        calls += 1;
        let line = match calls {
            1 => "OK 0",
            2 => "OK -4",
            _ => "OK 5",
        };
        vec![ServerOp::Send(line.to_string())]
    })
    .await
    .unwrap();

    let client = QtestClient::new();
    client.connect(&server.address).await.unwrap();
    let qtest = Qtest::new(client);

    qtest.rtas("ibm,get-system-parameter", 3, 0x1000, 1, 0x2000)
        .await
        .unwrap();

    let err = qtest
        .rtas("ibm,get-system-parameter", 3, 0x1000, 1, 0x2000)
        .await
        .unwrap_err();
    match err {
        Error::Qtest { reason, .. } => assert!(reason.contains("H_PARAMETER")),
        other => panic!("unexpected error: {:?}", other),
    }

    let err = qtest
        .rtas("ibm,get-system-parameter", 3, 0x1000, 1, 0x2000)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Qtest { .. }));

    qtest.client().disconnect().await;
}

#[tokio::test]
async fn qtest_session_over_unix_socket() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qtest.sock");

    let server = QtestServer::spawn_unix(&path, memory_responder(256))
        .await
        .unwrap();

    let client = QtestClient::new();
    client.connect(&server.address).await.unwrap();
    let qtest = Qtest::new(client);

    qtest.write(0, b"ping").await.unwrap();
    assert_eq!(qtest.read(0, 4).await.unwrap(), b"ping");

    qtest.client().disconnect().await;
}
