use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use super::{BaseProxy, Proxy};
use crate::config::{ProxyType, TcpProxyConfig};
use crate::error::{Result, TunnelError};

/// TCP 代理：在 `proxy_bind_addr:remote_port` 上直接监听，
/// 端口为 0 时由系统分配
pub struct TcpProxy {
    base: Arc<BaseProxy>,
    cfg: TcpProxyConfig,
    real_port: AtomicU16,
}

impl TcpProxy {
    pub fn new(base: Arc<BaseProxy>, cfg: TcpProxyConfig) -> Self {
        Self {
            base,
            cfg,
            real_port: AtomicU16::new(0),
        }
    }

    pub fn real_port(&self) -> u16 {
        self.real_port.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Proxy for TcpProxy {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Tcp
    }

    async fn run(self: Arc<Self>) -> Result<String> {
        let addr = format!("{}:{}", self.base.env.proxy_bind_addr, self.cfg.remote_port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TunnelError::PortInUse(self.cfg.remote_port)
            } else {
                TunnelError::listen_failed(addr.clone(), e)
            }
        })?;

        let real_port = listener.local_addr()?.port();
        self.real_port.store(real_port, Ordering::SeqCst);
        info!("tcp proxy '{}' listen port [{}]", self.base.name, real_port);

        self.base.clone().start_tcp_listen_handler(listener);
        Ok(format!(":{}", real_port))
    }

    async fn close(&self) {
        self.base.close_base().await;
    }
}
