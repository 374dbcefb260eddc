/// XTCP 打洞协调器
///
/// 维护 代理名 -> 打洞会话通道 的注册表。访问者携带会话 id 和共享
/// 密钥发起请求；协调器校验密钥后把请求转给注册方，并等待注册方
/// 确认探测成功。每个代理名同时只有一个会话通道，重复注册时替换
/// 旧通道。
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

/// 访问者等待注册方确认的默认时长
pub const NAT_HOLE_WAIT: Duration = Duration::from_secs(10);

/// 一次打洞会话的请求
#[derive(Debug)]
pub struct SidRequest {
    pub sid: String,
    /// 注册方探测成功后的边沿触发信号
    pub notify_tx: mpsc::Sender<()>,
}

struct ClientEntry {
    sk: String,
    sid_tx: mpsc::Sender<SidRequest>,
}

#[derive(Default)]
pub struct NatHoleController {
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl NatHoleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个 XTCP 代理，返回它的会话请求通道
    pub fn listen_client(&self, name: &str, sk: &str) -> mpsc::Receiver<SidRequest> {
        let (sid_tx, sid_rx) = mpsc::channel(8);
        let mut clients = self.clients.lock().unwrap();
        if clients
            .insert(
                name.to_string(),
                ClientEntry {
                    sk: sk.to_string(),
                    sid_tx,
                },
            )
            .is_some()
        {
            debug!("replaced existing nat hole registration for '{}'", name);
        }
        sid_rx
    }

    /// 注销代理；挂起的访问者等待随通道关闭而解除
    pub fn close_client(&self, name: &str) {
        self.clients.lock().unwrap().remove(name);
    }

    /// 处理访问者的打洞请求
    ///
    /// 匹配注册方并转发会话 id，等待注册方在 `wait` 内确认探测成功。
    pub async fn handle_visitor(&self, name: &str, sk: &str, sid: &str, wait: Duration) -> Result<()> {
        let sid_tx = {
            let clients = self.clients.lock().unwrap();
            let entry = clients.get(name).ok_or_else(|| {
                TunnelError::protocol(format!("no xtcp proxy registered with name '{}'", name))
            })?;
            if entry.sk != sk {
                warn!("visitor presented wrong secret key for '{}'", name);
                return Err(TunnelError::protocol("secret key mismatch"));
            }
            entry.sid_tx.clone()
        };

        let (notify_tx, mut notify_rx) = mpsc::channel(1);
        let request = SidRequest {
            sid: sid.to_string(),
            notify_tx,
        };
        if sid_tx.send(request).await.is_err() {
            return Err(TunnelError::protocol(format!(
                "xtcp proxy '{}' is no longer listening",
                name
            )));
        }

        match tokio::time::timeout(wait, notify_rx.recv()).await {
            Ok(Some(())) => Ok(()),
            // 通道被丢弃说明注册方侧失败
            Ok(None) => Err(TunnelError::PeerClosed),
            Err(_) => Err(TunnelError::Timeout(wait)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_visitor_matched_with_owner() {
        let ctl = Arc::new(NatHoleController::new());
        let mut sid_rx = ctl.listen_client("p2p", "s3cret");

        let visitor = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                ctl.handle_visitor("p2p", "s3cret", "abc", Duration::from_secs(2))
                    .await
            })
        };

        let request = sid_rx.recv().await.unwrap();
        assert_eq!(request.sid, "abc");
        // 注册方确认探测成功
        request.notify_tx.try_send(()).unwrap();

        assert!(visitor.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wrong_secret_key_rejected() {
        let ctl = NatHoleController::new();
        let _sid_rx = ctl.listen_client("p2p", "s3cret");

        let err = ctl
            .handle_visitor("p2p", "wrong", "abc", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_unknown_name_rejected() {
        let ctl = NatHoleController::new();
        let err = ctl
            .handle_visitor("nobody", "sk", "abc", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_visitor_times_out_without_confirmation() {
        let ctl = Arc::new(NatHoleController::new());
        let mut sid_rx = ctl.listen_client("p2p", "s3cret");

        let visitor = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                ctl.handle_visitor("p2p", "s3cret", "abc", Duration::from_millis(200))
                    .await
            })
        };

        // 收下请求但不确认
        let _request = sid_rx.recv().await.unwrap();
        let err = visitor.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_close_client_unblocks_pending_visitor() {
        let ctl = Arc::new(NatHoleController::new());
        let mut sid_rx = ctl.listen_client("p2p", "s3cret");

        let visitor = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                ctl.handle_visitor("p2p", "s3cret", "abc", Duration::from_secs(5))
                    .await
            })
        };

        let request = sid_rx.recv().await.unwrap();
        ctl.close_client("p2p");
        // 丢弃请求，挂起的访问者立刻解除等待
        drop(request);
        drop(sid_rx);

        let err = visitor.await.unwrap().unwrap_err();
        assert!(err.is_peer_closed());
    }

    #[tokio::test]
    async fn test_relisten_replaces_channel() {
        let ctl = NatHoleController::new();
        let _old_rx = ctl.listen_client("p2p", "s3cret");
        let mut new_rx = ctl.listen_client("p2p", "s3cret");

        let send = ctl.handle_visitor("p2p", "s3cret", "xyz", Duration::from_millis(200));
        tokio::pin!(send);

        tokio::select! {
            request = new_rx.recv() => {
                let request = request.unwrap();
                assert_eq!(request.sid, "xyz");
            }
            _ = &mut send => panic!("visitor resolved before owner saw the request"),
        }
    }
}
