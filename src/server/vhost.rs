/// vhost 复用器
///
/// HTTP/HTTPS 代理不直接监听端口：前端在共享端口上按 Host 头
/// （以及可选的 URL 前缀和 basic auth 用户名）解复用，把连接投递到
/// 对应代理注册的子监听器。本模块提供注册与投递两面：`listen`
/// 注册一条路由并返回子监听器，`dispatch` 由前端调用完成投递。
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Result, TunnelError};
use crate::msg::WorkConn;

/// 一条 vhost 路由
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VhostRouteConfig {
    pub domain: String,
    pub location: String,
    pub http_user: String,
    pub http_pwd: String,
    /// 重写转发请求的 Host 头
    pub rewrite_host: String,
    /// 附加到转发请求的头
    pub headers: HashMap<String, String>,
    pub route_by_http_user: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    domain: String,
    location: String,
    http_user: String,
}

impl RouteKey {
    fn new(cfg: &VhostRouteConfig) -> Self {
        Self {
            domain: cfg.domain.to_lowercase(),
            location: cfg.location.clone(),
            http_user: if cfg.route_by_http_user {
                cfg.http_user.clone()
            } else {
                String::new()
            },
        }
    }
}

struct RouteEntry {
    conn_tx: mpsc::Sender<WorkConn>,
    #[allow(dead_code)]
    cfg: VhostRouteConfig,
}

struct MuxerInner {
    kind: &'static str,
    routes: Mutex<HashMap<RouteKey, RouteEntry>>,
}

/// 按路由解复用的虚拟主机复用器，句柄可廉价克隆
#[derive(Clone)]
pub struct VhostMuxer {
    inner: Arc<MuxerInner>,
}

impl VhostMuxer {
    pub fn new(kind: &'static str) -> Self {
        Self {
            inner: Arc::new(MuxerInner {
                kind,
                routes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 注册一条路由，返回接收该路由连接的子监听器
    pub fn listen(&self, cfg: &VhostRouteConfig) -> Result<VhostListener> {
        let key = RouteKey::new(cfg);
        let mut routes = self.inner.routes.lock().unwrap();
        if routes.contains_key(&key) {
            return Err(TunnelError::listen_failed(
                format!("{} vhost {}{}", self.inner.kind, key.domain, key.location),
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "route already exists"),
            ));
        }

        let (conn_tx, conn_rx) = mpsc::channel(64);
        routes.insert(
            key.clone(),
            RouteEntry {
                conn_tx,
                cfg: cfg.clone(),
            },
        );
        info!(
            "{} vhost route registered: {}{}",
            self.inner.kind, key.domain, key.location
        );

        Ok(VhostListener {
            muxer: self.clone(),
            key,
            conn_rx,
            log_prefixes: Vec::new(),
        })
    }

    /// 把一条已按路由识别的连接投递给对应的子监听器
    ///
    /// 域名先精确匹配，再尝试通配（首段替换为 `*`）；location 取
    /// 最长前缀匹配。
    pub fn dispatch(&self, domain: &str, path: &str, http_user: &str, conn: WorkConn) -> Result<()> {
        let conn_tx = {
            let routes = self.inner.routes.lock().unwrap();
            let entry = find_route(&routes, &domain.to_lowercase(), path, http_user)
                .ok_or_else(|| {
                    TunnelError::protocol(format!(
                        "no {} route for host '{}'",
                        self.inner.kind, domain
                    ))
                })?;
            entry.conn_tx.clone()
        };

        conn_tx
            .try_send(conn)
            .map_err(|_| TunnelError::protocol("vhost listener backlog full or closed"))
    }

    fn unlisten(&self, key: &RouteKey) {
        if self.inner.routes.lock().unwrap().remove(key).is_some() {
            debug!(
                "{} vhost route removed: {}{}",
                self.inner.kind, key.domain, key.location
            );
        }
    }
}

fn find_route<'a>(
    routes: &'a HashMap<RouteKey, RouteEntry>,
    domain: &str,
    path: &str,
    http_user: &str,
) -> Option<&'a RouteEntry> {
    let wildcard = domain.split_once('.').map(|(_, rest)| format!("*.{}", rest));

    let mut best: Option<(&RouteKey, &RouteEntry)> = None;
    for (key, entry) in routes.iter() {
        if key.domain != domain && Some(&key.domain) != wildcard.as_ref() {
            continue;
        }
        if !key.http_user.is_empty() && key.http_user != http_user {
            continue;
        }
        if !path.starts_with(key.location.as_str()) {
            continue;
        }
        let better = match best {
            Some((best_key, _)) => key.location.len() > best_key.location.len(),
            None => true,
        };
        if better {
            best = Some((key, entry));
        }
    }
    best.map(|(_, entry)| entry)
}

/// vhost 子监听器，Drop 时自动注销路由
pub struct VhostListener {
    muxer: VhostMuxer,
    key: RouteKey,
    conn_rx: mpsc::Receiver<WorkConn>,
    log_prefixes: Vec<String>,
}

impl VhostListener {
    /// 接收下一条属于本路由的连接
    pub async fn accept(&mut self) -> Option<WorkConn> {
        self.conn_rx.recv().await
    }

    pub fn add_log_prefix(&mut self, prefix: impl Into<String>) {
        self.log_prefixes.push(prefix.into());
    }

    pub fn log_prefix(&self) -> String {
        self.log_prefixes.join("/")
    }

    pub fn domain(&self) -> &str {
        &self.key.domain
    }
}

impl Drop for VhostListener {
    fn drop(&mut self) {
        self.muxer.unlisten(&self.key);
    }
}

/// 规范化公开地址：80/443 端口省略端口号
pub fn canonical_addr(host: &str, port: u16) -> String {
    if port == 80 || port == 443 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}
