mod control;
mod nathole;
mod pool;
mod ports;
mod proxy;
mod stats;
mod vhost;

pub use control::{ControlManager, ControlSession, ProxyManager, ServerService};
pub use nathole::{NatHoleController, SidRequest, NAT_HOLE_WAIT};
pub use pool::WorkConnPool;
pub use ports::UdpPortManager;
pub use proxy::{
    handle_user_tcp_connection, new_proxy, BaseProxy, HttpProxy, HttpsProxy, Proxy, ProxyContext,
    ResourceController, TcpProxy, UdpProxy, XtcpProxy,
};
pub use stats::{ProxyStats, ProxyTrafficInfo, ServerStats, StatsCollector, StatsEvent};
pub use vhost::{canonical_addr, VhostListener, VhostMuxer, VhostRouteConfig};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ServerEnv;

/// 运行服务器
///
/// 在 `bind_addr:bind_port` 上接受客户端连接；每条连接的首条消息
/// 决定它是控制连接还是工作连接。Ctrl+C 时优雅退出。
pub async fn run_server(env: ServerEnv) -> Result<()> {
    env.validate()?;
    let env = Arc::new(env);
    let svc = ServerService::new(env.clone());

    let listen_addr = format!("{}:{}", env.bind_addr, env.bind_port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind control listener on {}", listen_addr))?;

    info!("tunnel server listening on {}", listen_addr);
    info!("Waiting for client connections... (Press Ctrl+C to stop)");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, peer_addr)) => {
                        info!("accepted connection from {}", peer_addr);
                        let svc = svc.clone();
                        tokio::spawn(async move {
                            control::handle_connection(svc, Box::new(conn)).await;
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("received shutdown signal, stopping server...");
                break;
            }
        }
    }

    info!("server stopped gracefully");
    Ok(())
}
