/// Common utilities for integration tests
use std::net::TcpListener;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use nat_tunnel::config::ServerEnv;
use nat_tunnel::msg::{read_msg, write_msg, Message};

pub const TEST_TOKEN: &str = "integration-test-token";

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Server environment bound to loopback with short timeouts
pub fn test_env(bind_port: u16) -> ServerEnv {
    ServerEnv {
        bind_addr: "127.0.0.1".to_string(),
        bind_port,
        proxy_bind_addr: "127.0.0.1".to_string(),
        auth_token: TEST_TOKEN.to_string(),
        udp_port_start: 36000,
        udp_port_end: 36500,
        user_conn_timeout: 2,
        ..Default::default()
    }
}

/// Wait for the server to accept connections
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Open a control connection and authenticate
pub async fn login(server_port: u16) -> (TcpStream, String) {
    let mut ctl = TcpStream::connect(("127.0.0.1", server_port))
        .await
        .expect("Failed to connect control conn");
    write_msg(
        &mut ctl,
        &Message::Login {
            token: TEST_TOKEN.to_string(),
            pool_count: 0,
            run_id: String::new(),
        },
    )
    .await
    .expect("Failed to send login");

    match read_next(&mut ctl).await {
        Message::LoginResp { run_id, error } => {
            assert!(error.is_empty(), "login rejected: {}", error);
            (ctl, run_id)
        }
        other => panic!("expected LoginResp, got {:?}", other),
    }
}

/// Read one message with a test timeout
pub async fn read_next(conn: &mut TcpStream) -> Message {
    timeout(Duration::from_secs(5), read_msg(conn))
        .await
        .expect("timed out reading message")
        .expect("failed to read message")
}

/// Read messages until one other than ReqWorkConn / Pong arrives;
/// every ReqWorkConn triggers `on_req`.
pub async fn read_skipping_requests(conn: &mut TcpStream) -> Message {
    loop {
        match read_next(conn).await {
            Message::ReqWorkConn | Message::Pong => continue,
            other => return other,
        }
    }
}

/// Dial a work connection and attach it to the session
pub async fn dial_work_conn(server_port: u16, run_id: &str) -> TcpStream {
    let mut conn = TcpStream::connect(("127.0.0.1", server_port))
        .await
        .expect("Failed to dial work conn");
    write_msg(
        &mut conn,
        &Message::NewWorkConn {
            run_id: run_id.to_string(),
        },
    )
    .await
    .expect("Failed to announce work conn");
    conn
}
