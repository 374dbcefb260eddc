/// 整机集成测试：真实服务器 + 脚本化客户端走完整协议
mod common;

use common::*;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use nat_tunnel::config::{ProxyConfig, ProxyKind, TcpProxyConfig};
use nat_tunnel::msg::{read_msg, write_msg, Message};
use nat_tunnel::server::run_server;

fn tcp_proxy_config(name: &str, remote_port: u16) -> ProxyConfig {
    ProxyConfig {
        name: name.to_string(),
        use_encryption: false,
        use_compression: false,
        kind: ProxyKind::Tcp(TcpProxyConfig { remote_port }),
    }
}

async fn start_server() -> u16 {
    let port = get_available_port();
    let env = test_env(port);
    tokio::spawn(async move {
        let _ = run_server(env).await;
    });
    assert!(wait_for_server(port, 50).await, "server did not come up");
    port
}

#[tokio::test]
async fn test_login_with_wrong_token_rejected() {
    let server_port = start_server().await;

    let mut ctl = TcpStream::connect(("127.0.0.1", server_port)).await.unwrap();
    write_msg(
        &mut ctl,
        &Message::Login {
            token: "wrong".to_string(),
            pool_count: 0,
            run_id: String::new(),
        },
    )
    .await
    .unwrap();

    match read_next(&mut ctl).await {
        Message::LoginResp { error, .. } => assert!(!error.is_empty()),
        other => panic!("expected LoginResp, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tcp_proxy_end_to_end() {
    let server_port = start_server().await;
    let (mut ctl, run_id) = login(server_port).await;

    let remote_port = get_available_port();
    write_msg(
        &mut ctl,
        &Message::NewProxy {
            proxy: tcp_proxy_config("web", remote_port),
        },
    )
    .await
    .unwrap();

    match read_skipping_requests(&mut ctl).await {
        Message::NewProxyResp {
            proxy_name,
            remote_addr,
            error,
        } => {
            assert_eq!(proxy_name, "web");
            assert!(error.is_empty(), "proxy rejected: {}", error);
            assert_eq!(remote_addr, format!(":{}", remote_port));
        }
        other => panic!("expected NewProxyResp, got {:?}", other),
    }

    // 客户端侧：应答 ReqWorkConn，在工作连接上完成 hello/HI 交换
    let client = tokio::spawn(async move {
        loop {
            match read_next(&mut ctl).await {
                Message::ReqWorkConn => {
                    let run_id = run_id.clone();
                    tokio::spawn(async move {
                        let mut work_conn = dial_work_conn(server_port, &run_id).await;
                        // 补充进池但没被配对的连接等不到消息，直接退出
                        let start = match timeout(Duration::from_secs(5), read_msg(&mut work_conn)).await {
                            Ok(Ok(message)) => message,
                            _ => return,
                        };
                        assert_eq!(
                            start,
                            Message::StartWorkConn {
                                proxy_name: "web".to_string()
                            }
                        );

                        let mut buf = [0u8; 5];
                        work_conn.read_exact(&mut buf).await.unwrap();
                        assert_eq!(&buf, b"hello");
                        work_conn.write_all(b"HI").await.unwrap();
                        work_conn.shutdown().await.unwrap();
                    });
                }
                _ => break,
            }
        }
    });

    // 访问者视角
    let mut visitor = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    visitor.write_all(b"hello").await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), visitor.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"HI");

    client.abort();
}

#[tokio::test]
async fn test_duplicate_proxy_name_rejected() {
    let server_port = start_server().await;
    let (mut ctl, _run_id) = login(server_port).await;

    write_msg(
        &mut ctl,
        &Message::NewProxy {
            proxy: tcp_proxy_config("dup", 0),
        },
    )
    .await
    .unwrap();
    match read_skipping_requests(&mut ctl).await {
        Message::NewProxyResp { error, .. } => assert!(error.is_empty()),
        other => panic!("expected NewProxyResp, got {:?}", other),
    }

    write_msg(
        &mut ctl,
        &Message::NewProxy {
            proxy: tcp_proxy_config("dup", 0),
        },
    )
    .await
    .unwrap();
    match read_skipping_requests(&mut ctl).await {
        Message::NewProxyResp { error, .. } => {
            assert!(error.contains("already in use"), "got error: {}", error)
        }
        other => panic!("expected NewProxyResp, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pool_starvation_closes_visitor() {
    let server_port = start_server().await;
    let (mut ctl, _run_id) = login(server_port).await;

    let remote_port = get_available_port();
    write_msg(
        &mut ctl,
        &Message::NewProxy {
            proxy: tcp_proxy_config("starved", remote_port),
        },
    )
    .await
    .unwrap();
    match read_skipping_requests(&mut ctl).await {
        Message::NewProxyResp { error, .. } => assert!(error.is_empty()),
        other => panic!("expected NewProxyResp, got {:?}", other),
    }

    // 客户端不应答任何 ReqWorkConn：访问者在池超时后被关闭
    let mut visitor = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();

    let mut buf = [0u8; 16];
    let result = timeout(Duration::from_secs(10), visitor.read(&mut buf))
        .await
        .expect("visitor should be closed after pool timeout");
    match result {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} bytes from starved proxy", n),
    }
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let server_port = start_server().await;
    let (mut ctl, _run_id) = login(server_port).await;

    write_msg(&mut ctl, &Message::Ping).await.unwrap();
    match read_next(&mut ctl).await {
        Message::Pong => {}
        other => panic!("expected Pong, got {:?}", other),
    }
}

#[tokio::test]
async fn test_proxy_name_freed_after_session_close() {
    let server_port = start_server().await;

    {
        let (mut ctl, _run_id) = login(server_port).await;
        write_msg(
            &mut ctl,
            &Message::NewProxy {
                proxy: tcp_proxy_config("reusable", 0),
            },
        )
        .await
        .unwrap();
        match read_skipping_requests(&mut ctl).await {
            Message::NewProxyResp { error, .. } => assert!(error.is_empty()),
            other => panic!("expected NewProxyResp, got {:?}", other),
        }
        // 控制连接断开触发会话清理
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (mut ctl, _run_id) = login(server_port).await;
    write_msg(
        &mut ctl,
        &Message::NewProxy {
            proxy: tcp_proxy_config("reusable", 0),
        },
    )
    .await
    .unwrap();
    match read_skipping_requests(&mut ctl).await {
        Message::NewProxyResp { error, .. } => {
            assert!(error.is_empty(), "name not freed: {}", error)
        }
        other => panic!("expected NewProxyResp, got {:?}", other),
    }
}
