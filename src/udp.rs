/// UDP 数据报与消息通道之间的编解码和泵
///
/// 数据报负载以 base64 编码进 `UdpPacket` 消息，在可靠流上与其它
/// 控制消息共用同一套编解码。两个泵分别服务于公网侧和本地服务侧：
///
/// - `forward_user_conn`：公网 UDP socket ↔ 消息通道（服务端）
/// - `forwarder`：消息通道 ↔ 本地 UDP 服务，按来源地址维护连接映射
///   （客户端）
///
/// 两端的入队都是非阻塞的，通道满时直接丢包。
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Result, TunnelError};
use crate::msg::UdpPacket;

/// 数据报读取缓冲区大小，超出的尾部被截断
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// 本地服务侧连接映射的空闲超时
const FORWARDER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// 封装一个 UDP 数据报
pub fn new_udp_packet(
    buf: &[u8],
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
) -> UdpPacket {
    UdpPacket {
        content: BASE64.encode(buf),
        local_addr,
        remote_addr,
    }
}

/// 解出数据报负载
pub fn get_content(packet: &UdpPacket) -> Result<Vec<u8>> {
    BASE64
        .decode(&packet.content)
        .map_err(|e| TunnelError::codec(e.to_string()))
}

/// 公网 UDP socket 与消息通道之间的双向泵
///
/// 回程方向由一个子任务驱动：从 `read_rx` 解包并写回数据报的来源
/// 地址。本函数自身读取公网数据报并入队 `send_tx`，socket 出错时
/// 返回，由调用方负责关闭代理。
pub async fn forward_user_conn(
    socket: Arc<UdpSocket>,
    mut read_rx: mpsc::Receiver<UdpPacket>,
    send_tx: mpsc::Sender<UdpPacket>,
) {
    let reply_socket = socket.clone();
    tokio::spawn(async move {
        while let Some(packet) = read_rx.recv().await {
            let buf = match get_content(&packet) {
                Ok(buf) => buf,
                Err(_) => continue,
            };
            let remote_addr = match packet.remote_addr {
                Some(addr) => addr,
                None => continue,
            };
            if let Err(e) = reply_socket.send_to(&buf, remote_addr).await {
                debug!("failed to send udp datagram to {}: {}", remote_addr, e);
            }
        }
    });

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, remote_addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                debug!("udp socket read error: {}", e);
                return;
            }
        };
        let packet = new_udp_packet(&buf[..n], None, Some(remote_addr));
        // 通道满时丢弃，慢速对端不能让队列膨胀
        let _ = send_tx.try_send(packet);
    }
}

/// 消息通道与本地 UDP 服务之间的泵
///
/// 为每个公网来源地址维护一个独立的已连接 socket，保持源 NAT 语义；
/// 空闲 30 秒后条目被淘汰，下一个数据报会重新拨号。`read_rx` 关闭时
/// 泵退出。
pub async fn forwarder(
    dst_addr: SocketAddr,
    mut read_rx: mpsc::Receiver<UdpPacket>,
    send_tx: mpsc::Sender<UdpPacket>,
) {
    let conns: Arc<Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    while let Some(packet) = read_rx.recv().await {
        let buf = match get_content(&packet) {
            Ok(buf) => buf,
            Err(_) => continue,
        };
        let remote_addr = match packet.remote_addr {
            Some(addr) => addr,
            None => continue,
        };

        let existing = conns.lock().unwrap().get(&remote_addr).cloned();
        let (conn, is_new) = match existing {
            Some(conn) => (conn, false),
            None => {
                let conn = match dial_local(dst_addr).await {
                    Ok(conn) => Arc::new(conn),
                    Err(e) => {
                        debug!("failed to dial local udp service {}: {}", dst_addr, e);
                        continue;
                    }
                };
                conns
                    .lock()
                    .unwrap()
                    .insert(remote_addr, conn.clone());
                (conn, true)
            }
        };

        if let Err(e) = conn.send(&buf).await {
            debug!("failed to write to local udp service: {}", e);
            conns.lock().unwrap().remove(&remote_addr);
            continue;
        }

        if is_new {
            let conns = conns.clone();
            let send_tx = send_tx.clone();
            tokio::spawn(async move {
                local_reader(remote_addr, conn, conns, send_tx).await;
            });
        }
    }
}

async fn dial_local(dst_addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr = if dst_addr.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(dst_addr).await?;
    Ok(socket)
}

/// 读取本地服务的响应并封包回传，空闲超时后淘汰映射条目
async fn local_reader(
    remote_addr: SocketAddr,
    conn: Arc<UdpSocket>,
    conns: Arc<Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>,
    send_tx: mpsc::Sender<UdpPacket>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let n = match timeout(FORWARDER_IDLE_TIMEOUT, conn.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => break,
        };
        let packet = new_udp_packet(&buf[..n], None, Some(remote_addr));
        if send_tx.try_send(packet).is_err() {
            trace!("dropping udp response for {}", remote_addr);
        }
    }
    conns.lock().unwrap().remove(&remote_addr);
}
