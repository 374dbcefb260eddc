/// 每客户端的工作连接池
///
/// 池不自己创建连接：服务器需要时通过控制通道向客户端发送
/// `ReqWorkConn`，客户端拨出的新连接经 `register_work_conn` 入池。
/// 取走的连接归调用方所有，用完必须关闭，不允许放回。
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, TunnelError};
use crate::msg::WorkConn;

/// 入池等待的连接数上限，超出的直接关闭
const POOL_CAPACITY: usize = 64;

pub struct WorkConnPool {
    conn_tx: mpsc::Sender<WorkConn>,
    conn_rx: Mutex<mpsc::Receiver<WorkConn>>,
    req_tx: mpsc::UnboundedSender<()>,
    closed: AtomicBool,
}

impl WorkConnPool {
    /// 创建连接池，返回池和补充请求的接收端
    ///
    /// 每当池需要新的工作连接时在返回的通道上发一个信号，
    /// 控制会话将其转换为发往客户端的 `ReqWorkConn`。
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (conn_tx, conn_rx) = mpsc::channel(POOL_CAPACITY);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let pool = Self {
            conn_tx,
            conn_rx: Mutex::new(conn_rx),
            req_tx,
            closed: AtomicBool::new(false),
        };
        (pool, req_rx)
    }

    /// 客户端拨出的新工作连接入池
    pub fn register_work_conn(&self, conn: WorkConn) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("work conn pool already closed, dropping new work conn");
            return;
        }
        if self.conn_tx.try_send(conn).is_err() {
            debug!("work conn pool is full, dropping new work conn");
        }
    }

    /// 取一条工作连接，等待超过 `wait` 则失败
    pub async fn get_work_conn(&self, wait: Duration) -> Result<WorkConn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::WorkConnUnavailable(
                "session closed".to_string(),
            ));
        }

        let mut conn_rx = self.conn_rx.lock().await;

        let conn = match conn_rx.try_recv() {
            Ok(conn) => conn,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Err(TunnelError::WorkConnUnavailable(
                    "session closed".to_string(),
                ));
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                // 池空，请求客户端补充一条再等
                let _ = self.req_tx.send(());
                match tokio::time::timeout(wait, conn_rx.recv()).await {
                    Err(_) => return Err(TunnelError::Timeout(wait)),
                    Ok(None) => {
                        return Err(TunnelError::WorkConnUnavailable(
                            "session closed".to_string(),
                        ));
                    }
                    Ok(Some(conn)) => conn,
                }
            }
        };

        trace!("got work conn from pool");
        // 取走一条就补一条，维持预热水位
        let _ = self.req_tx.send(());
        Ok(conn)
    }

    /// 关闭池：之后的注册被丢弃，排队中的连接全部关闭
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut conn_rx = self.conn_rx.lock().await;
        conn_rx.close();
        while conn_rx.try_recv().is_ok() {}
    }
}
