mod http;
mod https;
mod tcp;
mod udp;
mod xtcp;

pub use http::HttpProxy;
pub use https::HttpsProxy;
pub use tcp::TcpProxy;
pub use udp::UdpProxy;
pub use xtcp::XtcpProxy;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ProxyConfig, ProxyKind, ProxyType, ServerEnv};
use crate::crypto::{self, StreamKey};
use crate::error::Result;
use crate::msg::{self, Message, WorkConn};
use crate::server::nathole::NatHoleController;
use crate::server::pool::WorkConnPool;
use crate::server::ports::UdpPortManager;
use crate::server::stats::{StatsCollector, StatsEvent};
use crate::server::vhost::{VhostListener, VhostMuxer};

/// 进程级共享资源，所有代理通过它访问端口管理器、打洞协调器和
/// vhost 复用器
pub struct ResourceController {
    pub udp_port_manager: Arc<UdpPortManager>,
    pub nat_hole_controller: Option<Arc<NatHoleController>>,
    pub vhost_http_muxer: VhostMuxer,
    pub vhost_https_muxer: VhostMuxer,
}

impl ResourceController {
    pub fn new(env: &ServerEnv) -> Self {
        Self {
            udp_port_manager: Arc::new(UdpPortManager::new(
                env.udp_port_start,
                env.udp_port_end,
            )),
            nat_hole_controller: env
                .enable_nat_hole
                .then(|| Arc::new(NatHoleController::new())),
            vhost_http_muxer: VhostMuxer::new("http"),
            vhost_https_muxer: VhostMuxer::new("https"),
        }
    }
}

/// 代理构造所需的上下文，由所属客户端的控制会话提供
#[derive(Clone)]
pub struct ProxyContext {
    pub env: Arc<ServerEnv>,
    pub rc: Arc<ResourceController>,
    pub stats: StatsCollector,
    pub pool: Arc<WorkConnPool>,
}

/// 代理能力集合
///
/// `run` 只调用一次，返回对外公开的地址；`close` 幂等。
#[async_trait]
pub trait Proxy: Send + Sync {
    fn name(&self) -> &str;
    fn proxy_type(&self) -> ProxyType;
    async fn run(self: Arc<Self>) -> Result<String>;
    async fn close(&self);
}

/// 按配置变体构造代理
pub fn new_proxy(ctx: &ProxyContext, cfg: ProxyConfig) -> Arc<dyn Proxy> {
    let base = Arc::new(BaseProxy::new(ctx, &cfg));
    match cfg.kind {
        ProxyKind::Tcp(tcp_cfg) => Arc::new(TcpProxy::new(base, tcp_cfg)),
        ProxyKind::Udp(udp_cfg) => Arc::new(UdpProxy::new(base, udp_cfg)),
        ProxyKind::Http(http_cfg) => Arc::new(HttpProxy::new(base, http_cfg)),
        ProxyKind::Https(https_cfg) => Arc::new(HttpsProxy::new(base, https_cfg)),
        ProxyKind::Xtcp(xtcp_cfg) => Arc::new(XtcpProxy::new(base, xtcp_cfg)),
    }
}

/// 所有代理变体共享的状态与行为
pub struct BaseProxy {
    pub name: String,
    pub proxy_type: ProxyType,
    pub use_encryption: bool,
    pub use_compression: bool,
    pub env: Arc<ServerEnv>,
    pub rc: Arc<ResourceController>,
    pub stats: StatsCollector,
    pub pool: Arc<WorkConnPool>,
    stream_key: StreamKey,
    cancel: CancellationToken,
    closed: tokio::sync::Mutex<bool>,
    listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BaseProxy {
    pub fn new(ctx: &ProxyContext, cfg: &ProxyConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            proxy_type: cfg.proxy_type(),
            use_encryption: cfg.use_encryption,
            use_compression: cfg.use_compression,
            env: ctx.env.clone(),
            rc: ctx.rc.clone(),
            stats: ctx.stats.clone(),
            pool: ctx.pool.clone(),
            stream_key: crypto::derive_key(&ctx.env.auth_token),
            cancel: CancellationToken::new(),
            closed: tokio::sync::Mutex::new(false),
            listeners: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// 代理取消根：所有归属任务跟随它退出
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 从池里取一条工作连接
    pub async fn get_work_conn(&self) -> Result<WorkConn> {
        let wait = Duration::from_secs(self.env.user_conn_timeout);
        self.pool.get_work_conn(wait).await
    }

    /// 标记关闭并终止所有监听任务；返回是否是第一次关闭
    pub async fn close_base(&self) -> bool {
        let mut closed = self.closed.lock().await;
        if *closed {
            return false;
        }
        *closed = true;
        drop(closed);

        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.listeners.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        info!("proxy '{}' closed", self.name);
        true
    }

    /// 在 TCP 监听器上启动接受循环
    pub fn start_tcp_listen_handler(self: Arc<Self>, listener: TcpListener) {
        let base = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, peer_addr)) => {
                            trace!("proxy '{}' accepted connection from {}", base.name, peer_addr);
                            apply_keepalive(&conn);
                            let base = base.clone();
                            tokio::spawn(async move {
                                handle_user_tcp_connection(base, Box::new(conn)).await;
                            });
                        }
                        Err(e) => {
                            warn!("proxy '{}' accept error: {}", base.name, e);
                            break;
                        }
                    }
                }
            }
        });
        self.listeners.lock().unwrap().push(handle);
    }

    /// 在 vhost 子监听器上启动接受循环
    pub fn start_vhost_listen_handler(self: Arc<Self>, mut listener: VhostListener) {
        let base = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let prefix = listener.log_prefix();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Some(conn) => {
                            trace!("[{}] accepted vhost connection for '{}'", prefix, listener.domain());
                            let base = base.clone();
                            tokio::spawn(async move {
                                handle_user_tcp_connection(base, conn).await;
                            });
                        }
                        None => break,
                    }
                }
            }
        });
        self.listeners.lock().unwrap().push(handle);
    }
}

/// 把一条用户连接与一条工作连接配对并双向搬运数据
///
/// 拿不到工作连接时关掉用户连接并记一次连接关闭事件。配对成功后
/// 先发送 `StartWorkConn`，再按配置包装加密/压缩，随后两个方向
/// 各自拷贝到 EOF，字节数计入流量统计。
pub async fn handle_user_tcp_connection(base: Arc<BaseProxy>, user_conn: WorkConn) {
    let name = base.name.clone();

    let mut work_conn = match base.get_work_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("proxy '{}' failed to get work connection: {}", name, e);
            base.stats
                .mark(StatsEvent::CloseConnection { name });
            return;
        }
    };

    if let Err(e) = msg::write_msg(
        &mut work_conn,
        &Message::StartWorkConn {
            proxy_name: name.clone(),
        },
    )
    .await
    {
        warn!("proxy '{}' failed to send start message: {}", name, e);
        return;
    }

    let work_conn = crypto::wrap_work_conn(
        work_conn,
        &base.stream_key,
        base.use_encryption,
        base.use_compression,
    );

    base.stats.mark(StatsEvent::OpenConnection { name: name.clone() });
    debug!("proxy '{}' joining user connection with work connection", name);

    let (mut user_rd, mut user_wr) = tokio::io::split(user_conn);
    let (mut work_rd, mut work_wr) = tokio::io::split(work_conn);

    let user_to_work = async {
        let copied = tokio::io::copy(&mut user_rd, &mut work_wr).await;
        let _ = work_wr.shutdown().await;
        copied
    };
    let work_to_user = async {
        let copied = tokio::io::copy(&mut work_rd, &mut user_wr).await;
        let _ = user_wr.shutdown().await;
        copied
    };

    let (in_result, out_result) = tokio::join!(user_to_work, work_to_user);
    let in_bytes = in_result.unwrap_or(0) as i64;
    let out_bytes = out_result.unwrap_or(0) as i64;

    base.stats.mark(StatsEvent::CloseConnection { name: name.clone() });
    base.stats.mark(StatsEvent::AddTrafficIn {
        name: name.clone(),
        bytes: in_bytes,
    });
    base.stats.mark(StatsEvent::AddTrafficOut {
        name: name.clone(),
        bytes: out_bytes,
    });

    debug!(
        "proxy '{}' connection finished, in {} bytes, out {} bytes",
        name, in_bytes, out_bytes
    );
}

/// 给长连接代理的用户连接开启 TCP keepalive
fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        debug!("failed to set TCP keepalive: {}", e);
    }
}
