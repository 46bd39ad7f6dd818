//! Panel client tests against a scripted runner

use std::time::{Duration, Instant};

use lcsm_server::{Error, RunnerClient};
use serde_json::{Value, json};

mod common;
use common::spawn_mock_runner;

const CALL: Duration = Duration::from_secs(2);

#[tokio::test]
async fn first_frame_is_auth_token() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "s3cret");

    let (result, (frame, _conn)) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, CALL),
        async {
            let mut conn = mock.next_connection().await;
            let frame = conn.accept_auth().await;
            let request = conn.recv_json().await;
            assert_eq!(request["action"], "ListInstances");
            assert!(request["echo"].as_str().is_some_and(|e| e.parse::<i64>().is_ok()));
            conn.reply(&request, json!({"total": 0, "items": []})).await;
            (frame, conn)
        }
    );

    assert_eq!(frame, json!({"authToken": "s3cret"}));
    assert_eq!(result.unwrap(), Some(json!({"total": 0, "items": []})));
    assert!(client.is_connected());
}

#[tokio::test]
async fn responses_route_by_echo_in_any_order() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let calls = async {
        tokio::join!(
            client.invoke_raw("ListInstances", json!({"n": 1}), CALL),
            client.invoke_raw("ListInstances", json!({"n": 2}), CALL),
            client.invoke_raw("ListInstances", json!({"n": 3}), CALL),
        )
    };
    let script = async {
        let mut conn = mock.next_connection().await;
        conn.accept_auth().await;
        let requests = conn.recv_requests(3).await;
        for request in requests.iter().rev() {
            conn.reply(request, request["data"].clone()).await;
        }
        conn
    };

    let ((a, b, c), _conn) = tokio::join!(calls, script);
    assert_eq!(a.unwrap(), Some(json!({"n": 1})));
    assert_eq!(b.unwrap(), Some(json!({"n": 2})));
    assert_eq!(c.unwrap(), Some(json!({"n": 3})));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn concurrent_first_calls_share_one_handshake() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let calls = async {
        futures::future::join_all(
            (0..5).map(|i| client.invoke_raw("ListInstances", json!(i), CALL)),
        )
        .await
    };
    let script = async {
        let mut conn = mock.next_connection().await;
        conn.accept_auth().await;
        for request in conn.recv_requests(5).await {
            conn.reply(&request, request["data"].clone()).await;
        }
        conn
    };

    let (results, _conn) = tokio::join!(calls, script);
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), Some(json!(i)));
    }
    assert!(!mock.has_pending_connection());
}

#[tokio::test]
async fn timeout_frees_the_token() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let (result, (mut conn, stale)) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, Duration::from_millis(300)),
        async {
            let mut conn = mock.next_connection().await;
            conn.accept_auth().await;
            let request = conn.recv_json().await;
            (conn, request)
        }
    );

    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(client.pending_calls(), 0);

    // A late answer to the timed-out call is dropped; the connection keeps working
    conn.reply(&stale, json!("late")).await;

    let (result, ()) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, CALL),
        async {
            let request = conn.recv_json().await;
            conn.reply(&request, json!("fresh")).await;
        }
    );
    assert_eq!(result.unwrap(), Some(json!("fresh")));
}

#[tokio::test]
async fn unmatched_echo_is_ignored() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let (result, _conn) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, CALL),
        async {
            let mut conn = mock.next_connection().await;
            conn.accept_auth().await;
            let request = conn.recv_json().await;
            conn.send_json(&json!({"echo": "999", "data": 1})).await;
            conn.send_json(&json!("not a frame")).await;
            conn.reply(&request, json!(2)).await;
            conn
        }
    );

    assert_eq!(result.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn error_field_becomes_remote_error() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let (result, _conn) = tokio::join!(
        client.invoke_raw("Frobnicate", json!({}), CALL),
        async {
            let mut conn = mock.next_connection().await;
            conn.accept_auth().await;
            let request = conn.recv_json().await;
            conn.send_json(&json!({"echo": request["echo"], "error": "Unknown action"}))
                .await;
            conn
        }
    );

    match result {
        Err(Error::Remote(message)) => assert_eq!(message, "Unknown action"),
        other => panic!("expected remote error, got {other:?}"),
    }
    assert!(client.is_connected());
}

#[tokio::test]
async fn empty_success_decodes_as_unit() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let (result, _conn) = tokio::join!(client.start_instance(4), async {
        let mut conn = mock.next_connection().await;
        conn.accept_auth().await;
        let request = conn.recv_json().await;
        assert_eq!(request["action"], "StartInstance");
        assert_eq!(request["data"], json!(4));
        conn.send_json(&json!({"echo": request["echo"]})).await;
        conn
    });

    result.unwrap();
}

#[tokio::test]
async fn rejected_token_leaves_no_connection() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "wrong");

    let (result, ()) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, CALL),
        async { mock.next_connection().await.reject_auth().await }
    );

    match result {
        Err(Error::AuthenticationFailed(message)) => assert_eq!(message, "Authentication failed"),
        other => panic!("expected auth failure, got {other:?}"),
    }
    assert!(!client.is_connected());
    assert_eq!(client.pending_calls(), 0);

    // The next call tries a fresh handshake
    let (result, _conn) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, CALL),
        async {
            let mut conn = mock.next_connection().await;
            conn.accept_auth().await;
            let request = conn.recv_json().await;
            conn.reply(&request, json!(null)).await;
            conn
        }
    );
    assert_eq!(result.unwrap(), None);
}

#[tokio::test]
async fn dropped_connection_fails_pending_calls_then_reconnects() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let calls = async {
        tokio::join!(
            client.invoke_raw("ListInstances", json!(1), CALL),
            client.invoke_raw("ListInstances", json!(2), CALL),
            client.invoke_raw("ListInstances", json!(3), CALL),
        )
    };
    let script = async {
        let mut conn = mock.next_connection().await;
        conn.accept_auth().await;
        conn.recv_requests(3).await;
        conn.close().await;
    };

    let ((a, b, c), ()) = tokio::join!(calls, script);
    for result in [a, b, c] {
        assert!(matches!(result, Err(Error::ConnectionLost)), "got {result:?}");
    }
    assert_eq!(client.pending_calls(), 0);

    let (result, _conn) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, CALL),
        async {
            let mut conn = mock.next_connection().await;
            conn.accept_auth().await;
            let request = conn.recv_json().await;
            conn.reply(&request, json!("again")).await;
            conn
        }
    );
    assert_eq!(result.unwrap(), Some(json!("again")));
}

#[tokio::test]
async fn close_fails_in_flight_call() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let (result, _conn) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, CALL),
        async {
            let mut conn = mock.next_connection().await;
            conn.accept_auth().await;
            conn.recv_json().await;
            client.close().await;
            conn
        }
    );

    assert!(matches!(result, Err(Error::ConnectionLost)));
    assert!(!client.is_connected());
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn unreachable_runner_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RunnerClient::new(format!("ws://{addr}/lcsm-node.socket"), "t");
    let result = client.invoke_raw("ListInstances", Value::Null, CALL).await;

    let err = result.unwrap_err();
    assert!(err.is_connection_error(), "got {err:?}");
}

#[tokio::test]
async fn short_call_does_not_wait_out_another_callers_handshake() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let slow = client.invoke_raw("ListInstances", Value::Null, Duration::from_secs(3));
    let fast = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let result = client
            .invoke_raw("ListInstances", Value::Null, Duration::from_millis(200))
            .await;
        (result, started.elapsed())
    };
    // Take the auth frame and never answer it
    let script = async {
        let mut conn = mock.next_connection().await;
        conn.recv_json().await;
        conn
    };

    let (slow_result, (fast_result, elapsed), _conn) = tokio::join!(slow, fast, script);
    assert!(matches!(fast_result, Err(Error::Timeout(_))), "got {fast_result:?}");
    assert!(elapsed < Duration::from_secs(1), "short call took {elapsed:?}");
    assert!(matches!(slow_result, Err(Error::Timeout(_))), "got {slow_result:?}");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn handshake_time_counts_against_the_call_timeout() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");
    let started = Instant::now();

    let (result, _conn) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, Duration::from_secs(1)),
        async {
            let mut conn = mock.next_connection().await;
            conn.recv_json().await;
            tokio::time::sleep(Duration::from_millis(600)).await;
            conn.send_json(&json!({"status": "Authenticated"})).await;
            // The request arrives but is never answered
            conn.recv_json().await;
            conn
        }
    );

    let elapsed = started.elapsed();
    assert!(matches!(result, Err(Error::Timeout(_))), "got {result:?}");
    assert!(elapsed < Duration::from_millis(1500), "call took {elapsed:?}");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn expired_call_leaves_other_calls_waiting() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let (short, long, _conn) = tokio::join!(
        client.invoke_raw("ListInstances", json!("short"), Duration::from_millis(300)),
        client.invoke_raw("ListInstances", json!("long"), CALL),
        async {
            let mut conn = mock.next_connection().await;
            conn.accept_auth().await;
            let requests = conn.recv_requests(2).await;
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert_eq!(client.pending_calls(), 1);
            for request in &requests {
                conn.reply(request, request["data"].clone()).await;
            }
            conn
        }
    );

    assert!(matches!(short, Err(Error::Timeout(_))), "got {short:?}");
    assert_eq!(long.unwrap(), Some(json!("long")));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn repeated_timeouts_leave_no_entries() {
    const ROUNDS: usize = 20;

    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let calls = async {
        let warm = client.invoke_raw("ListInstances", Value::Null, CALL).await;
        let mut results = Vec::with_capacity(ROUNDS);
        for _ in 0..ROUNDS {
            results.push(
                client
                    .invoke_raw("ListInstances", Value::Null, Duration::from_millis(50))
                    .await,
            );
        }
        (warm, results)
    };
    let script = async {
        let mut conn = mock.next_connection().await;
        conn.accept_auth().await;
        let request = conn.recv_json().await;
        conn.reply(&request, json!("warm")).await;
        conn.recv_requests(ROUNDS).await;
        conn
    };

    let ((warm, results), _conn) = tokio::join!(calls, script);
    assert_eq!(warm.unwrap(), Some(json!("warm")));
    for result in results {
        assert!(matches!(result, Err(Error::Timeout(_))), "got {result:?}");
    }
    assert_eq!(client.pending_calls(), 0);
    assert!(client.is_connected());
}

#[tokio::test]
async fn tls_endpoint_is_refused_up_front() {
    let client = RunnerClient::new("wss://127.0.0.1:1/lcsm-node.socket", "t");
    let result = client.invoke_raw("ListInstances", Value::Null, CALL).await;
    assert!(matches!(result, Err(Error::Config(_))), "got {result:?}");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn dropping_the_client_closes_its_socket() {
    let mut mock = spawn_mock_runner().await;
    let client = RunnerClient::new(&mock.endpoint, "t");

    let (result, mut conn) = tokio::join!(
        client.invoke_raw("ListInstances", Value::Null, CALL),
        async {
            let mut conn = mock.next_connection().await;
            conn.accept_auth().await;
            let request = conn.recv_json().await;
            conn.reply(&request, json!(1)).await;
            conn
        }
    );
    assert_eq!(result.unwrap(), Some(json!(1)));

    drop(client);
    assert!(conn.wait_closed().await);
}
