use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BaseProxy, Proxy};
use crate::config::{ProxyType, XtcpProxyConfig};
use crate::error::{Result, TunnelError};
use crate::msg::{self, Message};
use crate::server::nathole::SidRequest;

/// XTCP 代理：不占用公网端口，只在打洞协调器上应答会话请求。
///
/// 每个请求拉一条工作连接下发会话 id，异步等待客户端的探测成功
/// 确认后触发访问者侧的通知。
pub struct XtcpProxy {
    base: Arc<BaseProxy>,
    cfg: XtcpProxyConfig,
}

impl XtcpProxy {
    pub fn new(base: Arc<BaseProxy>, cfg: XtcpProxyConfig) -> Self {
        Self { base, cfg }
    }
}

#[async_trait]
impl Proxy for XtcpProxy {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Xtcp
    }

    async fn run(self: Arc<Self>) -> Result<String> {
        let controller = self
            .base
            .rc
            .nat_hole_controller
            .clone()
            .ok_or_else(|| {
                TunnelError::config_invalid("xtcp is not supported: nat hole coordination disabled")
            })?;

        let sid_rx = controller.listen_client(&self.base.name, &self.cfg.sk);
        tokio::spawn(sid_request_loop(
            self.base.clone(),
            sid_rx,
            self.base.cancel_token(),
        ));
        Ok(String::new())
    }

    async fn close(&self) {
        if !self.base.close_base().await {
            return;
        }
        if let Some(controller) = &self.base.rc.nat_hole_controller {
            controller.close_client(&self.base.name);
        }
    }
}

async fn sid_request_loop(
    base: Arc<BaseProxy>,
    mut sid_rx: mpsc::Receiver<SidRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            request = sid_rx.recv() => match request {
                Some(request) => request,
                None => return,
            }
        };

        let mut work_conn = match base.get_work_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("xtcp proxy '{}' failed to get work connection: {}", base.name, e);
                continue;
            }
        };

        if let Err(e) = msg::write_msg(
            &mut work_conn,
            &Message::NatHoleSid {
                sid: request.sid.clone(),
            },
        )
        .await
        {
            warn!("xtcp proxy '{}' failed to send sid: {}", base.name, e);
            continue;
        }

        // 异步等客户端的探测确认，不阻塞后续会话请求
        let name = base.name.clone();
        tokio::spawn(async move {
            match msg::read_msg(&mut work_conn).await {
                Ok(Message::NatHoleClientDetectOk) => {
                    debug!("xtcp proxy '{}' client detect ok, sid [{}]", name, request.sid);
                    let _ = request.notify_tx.try_send(());
                }
                Ok(other) => {
                    warn!(
                        "xtcp proxy '{}' unexpected message waiting for detect ok: {:?}",
                        name, other
                    );
                }
                Err(e) => {
                    warn!("xtcp proxy '{}' read detect ok error: {}", name, e);
                }
            }
        });
    }
}
