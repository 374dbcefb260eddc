/// 本地服务健康检查
///
/// 周期性对客户端的本地服务做 TCP 连通或 HTTP GET 探测，
/// 连续失败达到阈值时报告失效，恢复后报告正常。状态变化是
/// 边沿触发的：只有跨越健康/失效边界时才发事件。
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::error::{Result, TunnelError};

/// 探测方式
#[derive(Debug, Clone)]
pub enum HealthCheckType {
    /// TCP 连通探测；地址为空时视为总是成功
    Tcp { addr: String },
    /// HTTP GET 探测，2xx 视为成功
    Http { url: String },
}

/// 健康状态事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Failed,
}

/// 健康检查配置
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub check_type: HealthCheckType,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_failed: u32,
}

impl HealthCheckConfig {
    pub fn new(check_type: HealthCheckType) -> Self {
        Self {
            check_type,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            max_failed: 1,
        }
    }
}

/// 健康检查监视器
pub struct HealthCheckMonitor {
    cfg: HealthCheckConfig,
    status_tx: tokio::sync::mpsc::UnboundedSender<HealthStatus>,
    cancel: CancellationToken,
}

impl HealthCheckMonitor {
    /// 创建监视器，返回状态事件的接收端
    pub fn new(
        mut cfg: HealthCheckConfig,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<HealthStatus>) {
        if cfg.interval.is_zero() {
            cfg.interval = Duration::from_secs(10);
        }
        if cfg.timeout.is_zero() {
            cfg.timeout = Duration::from_secs(3);
        }
        if cfg.max_failed == 0 {
            cfg.max_failed = 1;
        }
        let (status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                cfg,
                status_tx,
                cancel: CancellationToken::new(),
            },
            status_rx,
        )
    }

    /// 启动探测循环
    pub fn start(&self) {
        let cfg = self.cfg.clone();
        let status_tx = self.status_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut status_ok = false;
            let mut failed_times: u32 = 0;

            loop {
                let result = timeout(cfg.timeout, do_check(&cfg.check_type)).await;
                let result = match result {
                    Ok(result) => result,
                    Err(_) => Err(TunnelError::Timeout(cfg.timeout)),
                };

                match result {
                    Ok(()) => {
                        trace!("health check success");
                        failed_times = 0;
                        if !status_ok {
                            info!("health check status change to success");
                            status_ok = true;
                            let _ = status_tx.send(HealthStatus::Healthy);
                        }
                    }
                    Err(e) => {
                        warn!("health check failed: {}", e);
                        failed_times += 1;
                        if status_ok && failed_times >= cfg.max_failed {
                            warn!("health check status change to failed");
                            status_ok = false;
                            let _ = status_tx.send(HealthStatus::Failed);
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(cfg.interval) => {}
                }
            }
        });
    }

    /// 停止探测
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn do_check(check_type: &HealthCheckType) -> Result<()> {
    match check_type {
        HealthCheckType::Tcp { addr } => do_tcp_check(addr).await,
        HealthCheckType::Http { url } => do_http_check(url).await,
    }
}

async fn do_tcp_check(addr: &str) -> Result<()> {
    if addr.is_empty() {
        return Ok(());
    }
    let conn = TcpStream::connect(addr).await?;
    drop(conn);
    Ok(())
}

async fn do_http_check(url: &str) -> Result<()> {
    let (host_port, host, path) = parse_http_url(url)?;

    let mut conn = TcpStream::connect(&host_port).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    conn.write_all(request.as_bytes()).await?;

    let mut response = vec![0u8; 1024];
    let n = conn.read(&mut response).await?;
    let status_line = String::from_utf8_lossy(&response[..n]);
    let code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TunnelError::protocol("malformed http status line"))?;

    if code / 100 != 2 {
        return Err(TunnelError::protocol(format!(
            "http health check status code [{}] is not 2xx",
            code
        )));
    }
    Ok(())
}

/// 拆出连接地址、Host 头和请求路径
fn parse_http_url(url: &str) -> Result<(String, String, String)> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| TunnelError::config_invalid("health check url must start with http://"))?;
    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if host_port.is_empty() {
        return Err(TunnelError::config_invalid("health check url has no host"));
    }
    let addr = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{}:80", host_port)
    };
    let host = host_port.split(':').next().unwrap_or(host_port).to_string();
    Ok((addr, host, path.to_string()))
}
