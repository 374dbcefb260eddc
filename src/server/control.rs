/// 客户端控制会话
///
/// 服务器上每个客户端对应一个控制会话：认证后在控制连接上驱动
/// 代理注册、心跳和工作连接补充请求。客户端随后拨出的工作连接
/// 以 `NewWorkConn` 声明归属，被挂接到该会话的连接池。
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, ServerEnv};
use crate::error::{Result, TunnelError};
use crate::msg::{self, Message, WorkConn};
use crate::server::pool::WorkConnPool;
use crate::server::proxy::{new_proxy, Proxy, ProxyContext, ResourceController};
use crate::server::stats::{StatsCollector, StatsEvent};

/// 首条消息必须在这个时间内到达
const FIRST_MSG_TIMEOUT: Duration = Duration::from_secs(10);

/// 进程级代理注册表，保证同名代理同时只有一个存活
#[derive(Default)]
pub struct ProxyManager {
    proxies: Mutex<HashMap<String, Arc<dyn Proxy>>>,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str, proxy: Arc<dyn Proxy>) -> Result<()> {
        let mut proxies = self.proxies.lock().unwrap();
        if proxies.contains_key(name) {
            return Err(TunnelError::config_invalid(format!(
                "proxy name '{}' is already in use",
                name
            )));
        }
        proxies.insert(name.to_string(), proxy);
        Ok(())
    }

    fn unregister(&self, name: &str) {
        self.proxies.lock().unwrap().remove(name);
    }

    pub fn count(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }
}

/// 进程级会话注册表，run_id -> 会话
#[derive(Default)]
pub struct ControlManager {
    sessions: Mutex<HashMap<String, Arc<ControlSession>>>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn replace(&self, run_id: &str, session: Arc<ControlSession>) -> Option<Arc<ControlSession>> {
        self.sessions
            .lock()
            .unwrap()
            .insert(run_id.to_string(), session)
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<ControlSession>> {
        self.sessions.lock().unwrap().get(run_id).cloned()
    }

    fn remove_if_same(&self, run_id: &str, session: &Arc<ControlSession>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(current) = sessions.get(run_id) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(run_id);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

/// 顶层服务状态，接受循环与所有会话共享
pub struct ServerService {
    pub env: Arc<ServerEnv>,
    pub rc: Arc<ResourceController>,
    pub stats: StatsCollector,
    pub controls: ControlManager,
    pub proxies: ProxyManager,
}

impl ServerService {
    pub fn new(env: Arc<ServerEnv>) -> Arc<Self> {
        let rc = Arc::new(ResourceController::new(&env));
        Arc::new(Self {
            env,
            rc,
            stats: StatsCollector::new(),
            controls: ControlManager::new(),
            proxies: ProxyManager::new(),
        })
    }
}

/// 一个客户端的控制会话
pub struct ControlSession {
    pub run_id: String,
    pool: Arc<WorkConnPool>,
    msg_tx: mpsc::Sender<Message>,
    proxies: tokio::sync::Mutex<HashMap<String, Arc<dyn Proxy>>>,
    cancel: CancellationToken,
    closed: tokio::sync::Mutex<bool>,
}

impl ControlSession {
    /// 把客户端拨出的工作连接挂进本会话的池
    pub fn register_work_conn(&self, conn: WorkConn) {
        self.pool.register_work_conn(conn);
    }

    /// 关闭会话：注销并关闭所有代理，清空连接池
    async fn close(&self, svc: &ServerService) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        self.cancel.cancel();
        self.pool.close().await;

        let proxies: Vec<(String, Arc<dyn Proxy>)> =
            self.proxies.lock().await.drain().collect();
        for (name, proxy) in proxies {
            proxy.close().await;
            svc.proxies.unregister(&name);
            svc.stats.mark(StatsEvent::CloseProxy {
                name,
                proxy_type: proxy.proxy_type(),
            });
        }
        info!("control session [{}] closed", self.run_id);
    }

    /// 注册并启动一个代理，返回对外公开地址
    async fn register_proxy(&self, svc: &Arc<ServerService>, cfg: ProxyConfig) -> Result<String> {
        cfg.validate(&svc.env)?;
        let name = cfg.name.clone();
        let proxy_type = cfg.proxy_type();

        let ctx = ProxyContext {
            env: svc.env.clone(),
            rc: svc.rc.clone(),
            stats: svc.stats.clone(),
            pool: self.pool.clone(),
        };
        let proxy = new_proxy(&ctx, cfg);

        svc.proxies.register(&name, proxy.clone())?;
        match proxy.clone().run().await {
            Ok(remote_addr) => {
                self.proxies.lock().await.insert(name.clone(), proxy);
                svc.stats.mark(StatsEvent::NewProxy {
                    name: name.clone(),
                    proxy_type,
                });
                info!(
                    "control session [{}] started proxy '{}' at [{}]",
                    self.run_id, name, remote_addr
                );
                Ok(remote_addr)
            }
            Err(e) => {
                svc.proxies.unregister(&name);
                proxy.close().await;
                Err(e)
            }
        }
    }

    /// 注销一个代理
    async fn close_proxy(&self, svc: &ServerService, name: &str) {
        if let Some(proxy) = self.proxies.lock().await.remove(name) {
            proxy.close().await;
            svc.proxies.unregister(name);
            svc.stats.mark(StatsEvent::CloseProxy {
                name: name.to_string(),
                proxy_type: proxy.proxy_type(),
            });
        }
    }
}

/// 处理一条新接受的连接：首条消息决定它是控制连接还是工作连接
pub async fn handle_connection(svc: Arc<ServerService>, conn: WorkConn) {
    let mut conn = conn;
    let first = match tokio::time::timeout(FIRST_MSG_TIMEOUT, msg::read_msg(&mut conn)).await {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => {
            debug!("failed to read first message: {}", e);
            return;
        }
        Err(_) => {
            debug!("connection sent no message, dropping");
            return;
        }
    };

    match first {
        Message::Login {
            token,
            pool_count,
            run_id,
        } => {
            handle_login(svc, conn, token, pool_count, run_id).await;
        }
        Message::NewWorkConn { run_id } => match svc.controls.get(&run_id) {
            Some(session) => {
                debug!("work connection registered for session [{}]", run_id);
                session.register_work_conn(conn);
            }
            None => {
                warn!("work connection for unknown session [{}]", run_id);
            }
        },
        other => {
            warn!("unexpected first message on connection: {:?}", other);
        }
    }
}

async fn handle_login(
    svc: Arc<ServerService>,
    conn: WorkConn,
    token: String,
    pool_count: usize,
    run_id: String,
) {
    let mut conn = conn;

    if token != svc.env.auth_token {
        warn!("client authentication failed");
        let _ = msg::write_msg(
            &mut conn,
            &Message::LoginResp {
                run_id: String::new(),
                error: "authorization failed".to_string(),
            },
        )
        .await;
        return;
    }

    let run_id = if run_id.is_empty() {
        random_run_id()
    } else {
        run_id
    };

    let (pool, mut req_rx) = WorkConnPool::new();
    let (msg_tx, msg_rx) = mpsc::channel::<Message>(64);
    let session = Arc::new(ControlSession {
        run_id: run_id.clone(),
        pool: Arc::new(pool),
        msg_tx: msg_tx.clone(),
        proxies: tokio::sync::Mutex::new(HashMap::new()),
        cancel: CancellationToken::new(),
        closed: tokio::sync::Mutex::new(false),
    });

    // 同 run_id 重连时替换并关闭旧会话
    if let Some(old) = svc.controls.replace(&run_id, session.clone()) {
        info!("replacing existing control session [{}]", run_id);
        old.close(&svc).await;
    }

    if msg::write_msg(
        &mut conn,
        &Message::LoginResp {
            run_id: run_id.clone(),
            error: String::new(),
        },
    )
    .await
    .is_err()
    {
        session.close(&svc).await;
        svc.controls.remove_if_same(&run_id, &session);
        return;
    }

    info!("client login success, session [{}]", run_id);
    svc.stats.mark(StatsEvent::NewClient);

    let (conn_rd, conn_wr) = tokio::io::split(conn);

    // 写半边由独立任务驱动
    let writer = tokio::spawn(message_writer(conn_wr, msg_rx, session.cancel.clone()));

    // 池的补充请求转换为发往客户端的 ReqWorkConn
    {
        let msg_tx = msg_tx.clone();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = req_rx.recv() => match request {
                        Some(()) => {
                            if msg_tx.send(Message::ReqWorkConn).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
    }

    // 预热连接池
    let warm = pool_count.min(svc.env.max_pool_count);
    for _ in 0..warm {
        let _ = msg_tx.send(Message::ReqWorkConn).await;
    }

    read_loop(&svc, &session, conn_rd).await;

    session.close(&svc).await;
    svc.controls.remove_if_same(&run_id, &session);
    svc.stats.mark(StatsEvent::CloseClient);
    writer.abort();
}

async fn message_writer(
    mut conn_wr: WriteHalf<WorkConn>,
    mut msg_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = msg_rx.recv() => match message {
                Some(message) => {
                    if let Err(e) = msg::write_msg(&mut conn_wr, &message).await {
                        debug!("control connection write error: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

async fn read_loop(
    svc: &Arc<ServerService>,
    session: &Arc<ControlSession>,
    mut conn_rd: ReadHalf<WorkConn>,
) {
    let heartbeat_timeout = Duration::from_secs(svc.env.heartbeat_timeout);
    loop {
        let message = tokio::select! {
            _ = session.cancel.cancelled() => return,
            result = tokio::time::timeout(heartbeat_timeout, msg::read_msg(&mut conn_rd)) => match result {
                Err(_) => {
                    warn!("control session [{}] heartbeat timeout", session.run_id);
                    return;
                }
                Ok(Err(e)) => {
                    debug!("control session [{}] read error: {}", session.run_id, e);
                    return;
                }
                Ok(Ok(message)) => message,
            }
        };

        match message {
            Message::NewProxy { proxy } => {
                let proxy_name = proxy.name.clone();
                let resp = match session.register_proxy(svc, proxy).await {
                    Ok(remote_addr) => Message::NewProxyResp {
                        proxy_name,
                        remote_addr,
                        error: String::new(),
                    },
                    Err(e) => {
                        warn!(
                            "control session [{}] failed to start proxy '{}': {}",
                            session.run_id, proxy_name, e
                        );
                        Message::NewProxyResp {
                            proxy_name,
                            remote_addr: String::new(),
                            error: e.to_string(),
                        }
                    }
                };
                if session.msg_tx.send(resp).await.is_err() {
                    return;
                }
            }
            Message::CloseProxy { proxy_name } => {
                session.close_proxy(svc, &proxy_name).await;
            }
            Message::Ping => {
                if session.msg_tx.send(Message::Pong).await.is_err() {
                    return;
                }
            }
            other => {
                warn!(
                    "control session [{}] unexpected message: {:?}",
                    session.run_id, other
                );
            }
        }
    }
}

fn random_run_id() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_is_alphanumeric() {
        let id = random_run_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_proxy_manager_rejects_duplicate_names() {
        use crate::config::{ProxyConfig, ProxyKind, TcpProxyConfig};
        use crate::server::proxy::tests_support::test_context;

        let manager = ProxyManager::new();
        let ctx = test_context();
        let cfg = ProxyConfig {
            name: "web".to_string(),
            use_encryption: false,
            use_compression: false,
            kind: ProxyKind::Tcp(TcpProxyConfig { remote_port: 0 }),
        };
        let proxy = new_proxy(&ctx, cfg.clone());

        assert!(manager.register("web", proxy.clone()).is_ok());
        assert!(manager.register("web", proxy).is_err());

        manager.unregister("web");
        assert_eq!(manager.count(), 0);
    }
}
