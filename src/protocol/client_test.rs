use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use super::client::Session;
use super::error::ProtocolError;
use super::transport::{Connection, FrameReader};
use super::ToolCaller;
use crate::domain::mcp_types::{methods, METHOD_NOT_FOUND};

/// Scripted server end of an in-memory pipe
struct FakeServer {
    frames: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    async fn recv(&mut self) -> Value {
        let frame = self
            .frames
            .next_frame()
            .await
            .expect("read from client")
            .expect("client hung up");
        serde_json::from_slice(&frame).expect("client sent invalid json")
    }

    async fn send(&mut self, message: Value) {
        let mut bytes = serde_json::to_vec(&message).unwrap();
        bytes.push(b'\n');
        self.send_raw(&bytes).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn reply(&mut self, request: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
            .await;
    }

    async fn complete_handshake(&mut self, tools: Value) {
        let init = self.recv().await;
        assert_eq!(init["method"], methods::INITIALIZE);
        self.reply(
            &init,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "1.0.0"}
            }),
        )
        .await;

        let initialized = self.recv().await;
        assert_eq!(initialized["method"], methods::NOTIFY_INITIALIZED);
        assert!(initialized.get("id").is_none());

        let list = self.recv().await;
        assert_eq!(list["method"], methods::TOOLS_LIST);
        self.reply(&list, json!({ "tools": tools })).await;
    }
}

fn pipe() -> (Connection, FakeServer) {
    pipe_with_capacity(64 * 1024)
}

fn pipe_with_capacity(capacity: usize) -> (Connection, FakeServer) {
    let (client_io, server_io) = tokio::io::duplex(capacity);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);
    (
        Connection::from_io(client_read, client_write),
        FakeServer {
            frames: FrameReader::new(server_read),
            writer: server_write,
        },
    )
}

async fn connected(timeout: Duration) -> (Arc<Session>, FakeServer) {
    let (connection, mut server) = pipe();
    let connecting = tokio::spawn(Session::establish("fake", connection, timeout));
    server
        .complete_handshake(json!([{"name": "echo", "description": "Echo", "inputSchema": {"type": "object"}}]))
        .await;
    let session = connecting.await.unwrap().unwrap();
    (Arc::new(session), server)
}

#[tokio::test]
async fn test_connect_resolves_after_tool_listing() {
    let (connection, mut server) = pipe();
    let connecting = tokio::spawn(Session::establish("fake", connection, Duration::from_secs(5)));

    let init = server.recv().await;
    assert_eq!(init["params"]["protocolVersion"], "2024-11-05");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!connecting.is_finished());

    server
        .reply(
            &init,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "fake", "version": "1.0.0"}
            }),
        )
        .await;
    let _initialized = server.recv().await;
    let list = server.recv().await;
    assert!(!connecting.is_finished());
    server
        .reply(&list, json!({"tools": [{"name": "chat_with_a"}, {"name": "status_of_a"}]}))
        .await;

    let session = connecting.await.unwrap().unwrap();
    let names: Vec<String> = session.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["chat_with_a", "status_of_a"]);
    assert_eq!(session.server_info().unwrap().server_info.name, "fake");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (session, mut server) = connected(Duration::from_secs(5)).await;

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool_text("echo", json!({"text": "one"})).await })
    };
    let req_one = server.recv().await;
    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool_text("echo", json!({"text": "two"})).await })
    };
    let req_two = server.recv().await;

    assert_eq!(req_one["params"]["arguments"]["text"], "one");
    assert_eq!(req_two["params"]["arguments"]["text"], "two");
    assert_ne!(req_one["id"], req_two["id"]);

    server
        .reply(&req_two, json!({"content": [{"type": "text", "text": "reply two"}]}))
        .await;
    server
        .reply(&req_one, json!({"content": [{"type": "text", "text": "reply one"}]}))
        .await;

    assert_eq!(first.await.unwrap().unwrap(), "reply one");
    assert_eq!(second.await.unwrap().unwrap(), "reply two");
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_noise_and_unknown_ids_are_ignored() {
    let (session, mut server) = connected(Duration::from_secs(5)).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool_text("echo", json!({})).await })
    };
    let request = server.recv().await;

    server.send_raw(b"Starting up, please wait...\n").await;
    server.send_raw(b"{\"half\": \n").await;
    server.send_raw(&[0xff, 0xfe, b'\n']).await;
    server
        .send(json!({"jsonrpc": "2.0", "id": 9999, "result": {"content": []}}))
        .await;
    server
        .reply(&request, json!({"content": [{"type": "text", "text": "ok"}]}))
        .await;

    assert_eq!(call.await.unwrap().unwrap(), "ok");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_error_response_rejects_only_that_call() {
    let (session, mut server) = connected(Duration::from_secs(5)).await;

    let failing = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool("missing", json!({})).await })
    };
    let request = server.recv().await;
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32601, "message": "Tool not found: missing"}
        }))
        .await;

    match failing.await.unwrap() {
        Err(ProtocolError::Application { code, message }) => {
            assert_eq!(code, METHOD_NOT_FOUND);
            assert!(message.contains("missing"));
        }
        other => panic!("expected application error, got {:?}", other),
    }

    let ok = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool_text("echo", json!({})).await })
    };
    let request = server.recv().await;
    server
        .reply(&request, json!({"content": [{"type": "text", "text": "still alive"}]}))
        .await;
    assert_eq!(ok.await.unwrap().unwrap(), "still alive");
}

#[tokio::test]
async fn test_is_error_result_becomes_tool_failure() {
    let (session, mut server) = connected(Duration::from_secs(5)).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool_text("echo", json!({})).await })
    };
    let request = server.recv().await;
    server
        .reply(
            &request,
            json!({"content": [{"type": "text", "text": "model crashed"}], "isError": true}),
        )
        .await;

    match call.await.unwrap() {
        Err(ProtocolError::ToolFailed { tool, message }) => {
            assert_eq!(tool, "echo");
            assert_eq!(message, "model crashed");
        }
        other => panic!("expected tool failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_cancels_pending_and_is_idempotent() {
    let (session, mut server) = connected(Duration::from_secs(5)).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool("echo", json!({})).await })
    };
    let _request = server.recv().await;
    assert_eq!(session.pending_count(), 1);

    session.disconnect().await;
    assert!(matches!(call.await.unwrap(), Err(ProtocolError::Cancelled(_))));
    assert!(session.is_closed());
    assert_eq!(session.pending_count(), 0);

    session.disconnect().await;
    assert!(matches!(
        session.call_tool("echo", json!({})).await,
        Err(ProtocolError::Cancelled(_))
    ));
}

#[tokio::test]
async fn test_peer_close_fails_pending_with_transport_error() {
    let (session, mut server) = connected(Duration::from_secs(5)).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool("echo", json!({})).await })
    };
    let _request = server.recv().await;
    drop(server);

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_transport(), "unexpected error: {:?}", err);

    tokio::time::timeout(Duration::from_secs(1), session.closed())
        .await
        .expect("closed() should resolve after the peer hangs up");
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_peer_close_during_handshake_rejects_connect() {
    let (connection, mut server) = pipe();
    let connecting = tokio::spawn(Session::establish("fake", connection, Duration::from_secs(5)));

    let _init = server.recv().await;
    drop(server);

    let err = connecting.await.unwrap().err().unwrap();
    assert!(err.is_transport(), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_timeout_clears_pending_entry() {
    let (session, mut server) = connected(Duration::from_millis(100)).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool("echo", json!({})).await })
    };
    let request = server.recv().await;

    assert!(matches!(call.await.unwrap(), Err(ProtocolError::Timeout(_))));
    assert_eq!(session.pending_count(), 0);

    // A late answer for the abandoned id is dropped quietly.
    server
        .reply(&request, json!({"content": [{"type": "text", "text": "late"}]}))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_server_initiated_request_is_declined() {
    let (session, mut server) = connected(Duration::from_secs(5)).await;

    server
        .send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "sampling/createMessage", "params": {}}))
        .await;
    let answer = server.recv().await;
    assert_eq!(answer["id"], "srv-1");
    assert_eq!(answer["error"]["code"], METHOD_NOT_FOUND);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_tools_notification_refreshes_cache() {
    let (session, mut server) = connected(Duration::from_secs(5)).await;
    assert_eq!(session.tools().len(), 1);

    server
        .send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools",
            "params": {"tools": [{"name": "a"}, {"name": "b"}]}
        }))
        .await;

    let refreshed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if session.tools().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(refreshed.is_ok());
}

#[tokio::test]
async fn test_reader_keeps_dispatching_while_a_write_is_stalled() {
    let (connection, mut server) = pipe_with_capacity(1024);
    let connecting = tokio::spawn(Session::establish("fake", connection, Duration::from_secs(5)));
    server.complete_handshake(json!([{"name": "echo"}])).await;
    let session = Arc::new(connecting.await.unwrap().unwrap());

    // Far larger than the pipe, so the write blocks until the server reads.
    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call_tool_text("echo", json!({"text": "x".repeat(16 * 1024)})).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    server
        .send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "roots/list"}))
        .await;
    server
        .send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools",
            "params": {"tools": [{"name": "a"}, {"name": "b"}]}
        }))
        .await;

    let refreshed = tokio::time::timeout(Duration::from_secs(1), async {
        while session.tools().len() != 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(refreshed.is_ok(), "reader stalled behind a blocked write");

    let request = server.recv().await;
    assert_eq!(request["params"]["name"], "echo");
    let declined = server.recv().await;
    assert_eq!(declined["id"], "srv-1");
    assert_eq!(declined["error"]["code"], METHOD_NOT_FOUND);

    server
        .reply(&request, json!({"content": [{"type": "text", "text": "ok"}]}))
        .await;
    assert_eq!(call.await.unwrap().unwrap(), "ok");
    session.disconnect().await;
}
