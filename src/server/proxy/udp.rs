use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{BaseProxy, Proxy};
use crate::config::{ProxyType, UdpProxyConfig};
use crate::error::{Result, TunnelError};
use crate::msg::{self, Message, UdpPacket, WorkConn};
use crate::server::stats::StatsEvent;
use crate::udp;

/// 数据报通道容量
const UDP_CHANNEL_SIZE: usize = 1024;

/// 工作连接读超时；客户端以心跳维持连接
const WORK_CONN_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// 取工作连接失败后的重试间隔
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// UDP 代理
///
/// 公网 UDP socket 常驻；同一时刻只有一条工作连接承载全部数据报，
/// 连接失效时由监督任务从池里换一条新的，公网 socket 不受影响。
pub struct UdpProxy {
    base: Arc<BaseProxy>,
    cfg: UdpProxyConfig,
    real_port: AtomicU16,
}

impl UdpProxy {
    pub fn new(base: Arc<BaseProxy>, cfg: UdpProxyConfig) -> Self {
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
impl Proxy for UdpProxy {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Udp
    }

    async fn run(self: Arc<Self>) -> Result<String> {
        let port_manager = self.base.rc.udp_port_manager.clone();
        let real_port = port_manager.acquire(&self.base.name, self.cfg.remote_port)?;
        self.real_port.store(real_port, Ordering::SeqCst);

        let bind_addr = format!("{}:{}", self.base.env.proxy_bind_addr, real_port);
        let socket = match UdpSocket::bind(&bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!("udp proxy '{}' listen error: {}", self.base.name, e);
                port_manager.release(real_port);
                self.real_port.store(0, Ordering::SeqCst);
                return Err(if e.kind() == std::io::ErrorKind::AddrInUse {
                    TunnelError::PortInUse(real_port)
                } else {
                    TunnelError::listen_failed(bind_addr, e)
                });
            }
        };
        info!("udp proxy '{}' listen port [{}]", self.base.name, real_port);

        let (send_tx, send_rx) = mpsc::channel::<UdpPacket>(UDP_CHANNEL_SIZE);
        let (read_tx, read_rx) = mpsc::channel::<UdpPacket>(UDP_CHANNEL_SIZE);
        let send_rx = Arc::new(Mutex::new(send_rx));
        let cancel = self.base.cancel_token();

        tokio::spawn(work_conn_supervisor(
            self.base.clone(),
            send_rx,
            read_tx,
            cancel.clone(),
        ));

        // 公网侧泵；socket 失效意味着代理整体失效
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = udp::forward_user_conn(socket, read_rx, send_tx) => {
                    this.close().await;
                }
            }
        });

        Ok(format!(":{}", real_port))
    }

    async fn close(&self) {
        if !self.base.close_base().await {
            return;
        }
        let real_port = self.real_port.swap(0, Ordering::SeqCst);
        if real_port != 0 {
            self.base.rc.udp_port_manager.release(real_port);
        }
    }
}

/// 工作连接监督任务
///
/// 从池里取连接并安装读写泵，连接失效时换新的重来。起始先等一拍，
/// 让客户端先收到代理注册成功的响应。
async fn work_conn_supervisor(
    base: Arc<BaseProxy>,
    send_rx: Arc<Mutex<mpsc::Receiver<UdpPacket>>>,
    read_tx: mpsc::Sender<UdpPacket>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sleep(Duration::from_millis(500)) => {}
    }

    let (close_tx, mut close_rx) = mpsc::channel::<()>(1);

    loop {
        let work_conn = tokio::select! {
            _ = cancel.cancelled() => return,
            result = base.get_work_conn() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("udp proxy '{}' failed to get work connection: {}", base.name, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(RECONNECT_INTERVAL) => {}
                    }
                    continue;
                }
            }
        };
        // 关闭与取连接赛跑时，刚取到的连接也要随之丢弃关闭
        if cancel.is_cancelled() {
            return;
        }

        debug!("udp proxy '{}' installed a new work connection", base.name);
        let conn_cancel = cancel.child_token();
        let (conn_rd, conn_wr) = tokio::io::split(work_conn);

        tokio::spawn(work_conn_reader(
            base.clone(),
            conn_rd,
            read_tx.clone(),
            close_tx.clone(),
            conn_cancel.clone(),
        ));
        tokio::spawn(work_conn_sender(
            base.clone(),
            conn_wr,
            send_rx.clone(),
            close_tx.clone(),
            conn_cancel.clone(),
        ));

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = close_rx.recv() => {
                conn_cancel.cancel();
                while close_rx.try_recv().is_ok() {}
                debug!("udp proxy '{}' replacing work connection", base.name);
            }
        }
    }
}

/// 读泵：解出工作连接上的消息，数据报转入 `read_tx`
///
/// 心跳只刷新读超时；任何读错误通知监督任务换连接。
async fn work_conn_reader(
    base: Arc<BaseProxy>,
    mut conn_rd: ReadHalf<WorkConn>,
    read_tx: mpsc::Sender<UdpPacket>,
    close_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            result = timeout(WORK_CONN_READ_TIMEOUT, msg::read_msg(&mut conn_rd)) => match result {
                Err(_) => {
                    warn!("udp proxy '{}' work connection silent too long", base.name);
                    let _ = close_tx.try_send(());
                    return;
                }
                Ok(Err(e)) => {
                    warn!("udp proxy '{}' read from work connection error: {}", base.name, e);
                    let _ = close_tx.try_send(());
                    return;
                }
                Ok(Ok(message)) => message,
            }
        };

        match message {
            Message::Ping => {
                trace!("udp proxy '{}' work connection got ping", base.name);
            }
            Message::UdpPacket(packet) => {
                let bytes = packet.content.len() as i64;
                match read_tx.try_send(packet) {
                    Ok(()) => {
                        base.stats.mark(StatsEvent::AddTrafficOut {
                            name: base.name.clone(),
                            bytes,
                        });
                    }
                    Err(TrySendError::Full(_)) => {
                        trace!("udp proxy '{}' read channel full, dropping packet", base.name);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("udp proxy '{}' reader exiting, proxy closed", base.name);
                        return;
                    }
                }
            }
            other => {
                trace!("udp proxy '{}' ignoring message on work connection: {:?}", base.name, other);
            }
        }
    }
}

/// 写泵：把出站数据报封帧写到工作连接
async fn work_conn_sender(
    base: Arc<BaseProxy>,
    mut conn_wr: WriteHalf<WorkConn>,
    send_rx: Arc<Mutex<mpsc::Receiver<UdpPacket>>>,
    close_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    // 上一代写泵退出后才能拿到接收端
    let mut send_rx = send_rx.lock().await;

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            packet = send_rx.recv() => match packet {
                Some(packet) => packet,
                None => return,
            }
        };

        let bytes = packet.content.len() as i64;
        if let Err(e) = msg::write_msg(&mut conn_wr, &Message::UdpPacket(packet)).await {
            debug!("udp proxy '{}' sender exiting: {}", base.name, e);
            let _ = close_tx.try_send(());
            return;
        }
        base.stats.mark(StatsEvent::AddTrafficIn {
            name: base.name.clone(),
            bytes,
        });
    }
}
