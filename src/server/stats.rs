/// 服务器统计收集器
///
/// 事件驱动：各处调用 `mark` 投递类型化事件，由单个后台任务串行
/// 消化到全局统计里。收集器本身永不失败；事件队列满时丢弃并告警。
/// 流量按天分桶，保留最近 7 天。
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::ProxyType;
use crate::metric::{Counter, DateCounter};

/// 事件队列容量
const EVENT_QUEUE_SIZE: usize = 2048;

/// 统计事件
#[derive(Debug, Clone)]
pub enum StatsEvent {
    NewClient,
    CloseClient,
    NewProxy {
        name: String,
        proxy_type: ProxyType,
    },
    CloseProxy {
        name: String,
        proxy_type: ProxyType,
    },
    OpenConnection {
        name: String,
    },
    CloseConnection {
        name: String,
    },
    AddTrafficIn {
        name: String,
        bytes: i64,
    },
    AddTrafficOut {
        name: String,
        bytes: i64,
    },
}

/// 单个代理的统计（对外快照）
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub name: String,
    pub proxy_type: String,
    pub today_traffic_in: i64,
    pub today_traffic_out: i64,
    pub cur_conns: i64,
    pub last_start_time: String,
    pub last_close_time: String,
}

/// 全局统计（对外快照）
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub total_traffic_in: i64,
    pub total_traffic_out: i64,
    pub cur_conns: i64,
    pub client_counts: i64,
    pub proxy_type_counts: HashMap<String, i64>,
}

/// 单个代理最近 7 天的流量，从新到旧
#[derive(Debug, Clone, Serialize)]
pub struct ProxyTrafficInfo {
    pub name: String,
    pub traffic_in: Vec<i64>,
    pub traffic_out: Vec<i64>,
}

struct ProxyStatistics {
    name: String,
    proxy_type: ProxyType,
    traffic_in: DateCounter,
    traffic_out: DateCounter,
    cur_conns: Counter,
    last_start_time: Option<DateTime<Local>>,
    last_close_time: Option<DateTime<Local>>,
}

#[derive(Default)]
struct ServerStatistics {
    total_traffic_in: DateCounter,
    total_traffic_out: DateCounter,
    cur_conns: Counter,
    client_counts: Counter,
    proxy_type_counts: HashMap<ProxyType, Counter>,
    proxy_statistics: HashMap<String, ProxyStatistics>,
}

impl ServerStatistics {
    fn apply(&mut self, event: StatsEvent, now: DateTime<Local>) {
        let today = now.date_naive();
        match event {
            StatsEvent::NewClient => self.client_counts.inc(1),
            StatsEvent::CloseClient => self.client_counts.dec(1),
            StatsEvent::NewProxy { name, proxy_type } => {
                let entry = self
                    .proxy_statistics
                    .entry(name.clone())
                    .or_insert_with(|| ProxyStatistics {
                        name,
                        proxy_type,
                        traffic_in: DateCounter::default(),
                        traffic_out: DateCounter::default(),
                        cur_conns: Counter::new(),
                        last_start_time: None,
                        last_close_time: None,
                    });
                entry.proxy_type = proxy_type;
                entry.last_start_time = Some(now);
                self.proxy_type_counts
                    .entry(proxy_type)
                    .or_default()
                    .inc(1);
            }
            StatsEvent::CloseProxy { name, proxy_type } => {
                if let Some(entry) = self.proxy_statistics.get_mut(&name) {
                    entry.last_close_time = Some(now);
                }
                if let Some(counter) = self.proxy_type_counts.get_mut(&proxy_type) {
                    counter.dec(1);
                }
            }
            StatsEvent::OpenConnection { name } => {
                self.cur_conns.inc(1);
                if let Some(entry) = self.proxy_statistics.get_mut(&name) {
                    entry.cur_conns.inc(1);
                }
            }
            StatsEvent::CloseConnection { name } => {
                self.cur_conns.dec(1);
                if let Some(entry) = self.proxy_statistics.get_mut(&name) {
                    entry.cur_conns.dec(1);
                }
            }
            StatsEvent::AddTrafficIn { name, bytes } => {
                self.total_traffic_in.inc_on(today, bytes);
                if let Some(entry) = self.proxy_statistics.get_mut(&name) {
                    entry.traffic_in.inc_on(today, bytes);
                }
            }
            StatsEvent::AddTrafficOut { name, bytes } => {
                self.total_traffic_out.inc_on(today, bytes);
                if let Some(entry) = self.proxy_statistics.get_mut(&name) {
                    entry.traffic_out.inc_on(today, bytes);
                }
            }
        }
    }
}

/// 统计收集器句柄，可廉价克隆
#[derive(Clone)]
pub struct StatsCollector {
    event_tx: mpsc::Sender<StatsEvent>,
    inner: Arc<Mutex<ServerStatistics>>,
}

impl StatsCollector {
    /// 创建收集器并启动消化任务
    pub fn new() -> Self {
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let inner = Arc::new(Mutex::new(ServerStatistics::default()));

        let drain = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                drain.lock().unwrap().apply(event, Local::now());
            }
        });

        Self { event_tx, inner }
    }

    /// 投递一个统计事件，队列满时丢弃
    pub fn mark(&self, event: StatsEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("stats event dropped: {}", e);
        }
    }

    /// 全局统计快照
    pub fn get_server(&self) -> ServerStats {
        let today = Local::now().date_naive();
        let mut inner = self.inner.lock().unwrap();
        ServerStats {
            total_traffic_in: inner.total_traffic_in.today_count(today),
            total_traffic_out: inner.total_traffic_out.today_count(today),
            cur_conns: inner.cur_conns.count(),
            client_counts: inner.client_counts.count(),
            proxy_type_counts: inner
                .proxy_type_counts
                .iter()
                .map(|(t, c)| (t.to_string(), c.count()))
                .collect(),
        }
    }

    /// 按类型列出代理统计
    pub fn get_proxies_by_type(&self, proxy_type: ProxyType) -> Vec<ProxyStats> {
        let today = Local::now().date_naive();
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut names: Vec<String> = inner
            .proxy_statistics
            .values()
            .filter(|p| p.proxy_type == proxy_type)
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        for name in names {
            if let Some(stats) = inner.proxy_statistics.get_mut(&name) {
                out.push(snapshot(stats, today));
            }
        }
        out
    }

    /// 按类型和名称取单个代理的统计
    pub fn get_proxy_stats(&self, proxy_type: ProxyType, name: &str) -> Option<ProxyStats> {
        let today = Local::now().date_naive();
        let mut inner = self.inner.lock().unwrap();
        inner
            .proxy_statistics
            .get_mut(name)
            .filter(|p| p.proxy_type == proxy_type)
            .map(|p| snapshot(p, today))
    }

    /// 最近 7 天的流量，从新到旧
    pub fn get_proxy_traffic(&self, name: &str) -> Option<ProxyTrafficInfo> {
        let today = Local::now().date_naive();
        let mut inner = self.inner.lock().unwrap();
        inner.proxy_statistics.get_mut(name).map(|p| ProxyTrafficInfo {
            name: p.name.clone(),
            traffic_in: p.traffic_in.last_days(today),
            traffic_out: p.traffic_out.last_days(today),
        })
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(stats: &mut ProxyStatistics, today: chrono::NaiveDate) -> ProxyStats {
    ProxyStats {
        name: stats.name.clone(),
        proxy_type: stats.proxy_type.to_string(),
        today_traffic_in: stats.traffic_in.today_count(today),
        today_traffic_out: stats.traffic_out.today_count(today),
        cur_conns: stats.cur_conns.count(),
        last_start_time: format_time(stats.last_start_time),
        last_close_time: format_time(stats.last_close_time),
    }
}

fn format_time(t: Option<DateTime<Local>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::RESERVE_DAYS;
    use chrono::TimeZone;
    use std::time::Duration;

    /// 等待后台任务消化完已投递的事件
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_client_counts() {
        let collector = StatsCollector::new();
        collector.mark(StatsEvent::NewClient);
        collector.mark(StatsEvent::NewClient);
        collector.mark(StatsEvent::CloseClient);
        settle().await;

        assert_eq!(collector.get_server().client_counts, 1);
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let collector = StatsCollector::new();
        collector.mark(StatsEvent::NewProxy {
            name: "web".to_string(),
            proxy_type: ProxyType::Tcp,
        });
        collector.mark(StatsEvent::OpenConnection {
            name: "web".to_string(),
        });
        settle().await;

        let stats = collector.get_proxy_stats(ProxyType::Tcp, "web").unwrap();
        assert_eq!(stats.cur_conns, 1);
        assert_eq!(collector.get_server().cur_conns, 1);

        collector.mark(StatsEvent::CloseConnection {
            name: "web".to_string(),
        });
        settle().await;

        let stats = collector.get_proxy_stats(ProxyType::Tcp, "web").unwrap();
        assert_eq!(stats.cur_conns, 0);
        assert_eq!(collector.get_server().cur_conns, 0);
    }

    #[tokio::test]
    async fn test_cur_conns_never_negative() {
        let collector = StatsCollector::new();
        collector.mark(StatsEvent::CloseConnection {
            name: "web".to_string(),
        });
        settle().await;
        assert_eq!(collector.get_server().cur_conns, 0);
    }

    #[tokio::test]
    async fn test_traffic_accumulates() {
        let collector = StatsCollector::new();
        collector.mark(StatsEvent::NewProxy {
            name: "web".to_string(),
            proxy_type: ProxyType::Tcp,
        });
        collector.mark(StatsEvent::AddTrafficIn {
            name: "web".to_string(),
            bytes: 5,
        });
        collector.mark(StatsEvent::AddTrafficOut {
            name: "web".to_string(),
            bytes: 2,
        });
        settle().await;

        let stats = collector.get_proxy_stats(ProxyType::Tcp, "web").unwrap();
        assert_eq!(stats.today_traffic_in, 5);
        assert_eq!(stats.today_traffic_out, 2);

        let traffic = collector.get_proxy_traffic("web").unwrap();
        assert_eq!(traffic.traffic_in.len(), RESERVE_DAYS);
        assert_eq!(traffic.traffic_in[0], 5);
        assert_eq!(traffic.traffic_out[0], 2);
    }

    #[tokio::test]
    async fn test_proxy_type_counts() {
        let collector = StatsCollector::new();
        collector.mark(StatsEvent::NewProxy {
            name: "a".to_string(),
            proxy_type: ProxyType::Tcp,
        });
        collector.mark(StatsEvent::NewProxy {
            name: "b".to_string(),
            proxy_type: ProxyType::Tcp,
        });
        collector.mark(StatsEvent::CloseProxy {
            name: "a".to_string(),
            proxy_type: ProxyType::Tcp,
        });
        settle().await;

        let server = collector.get_server();
        assert_eq!(server.proxy_type_counts.get("tcp"), Some(&1));
    }

    #[test]
    fn test_traffic_across_midnight() {
        // 直接驱动内部状态机，精确控制时钟
        let mut stats = ServerStatistics::default();
        let before = Local.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let after = Local.with_ymd_and_hms(2024, 3, 10, 0, 0, 1).unwrap();

        stats.apply(
            StatsEvent::NewProxy {
                name: "web".to_string(),
                proxy_type: ProxyType::Tcp,
            },
            before,
        );
        stats.apply(
            StatsEvent::AddTrafficIn {
                name: "web".to_string(),
                bytes: 100,
            },
            before,
        );
        stats.apply(
            StatsEvent::AddTrafficIn {
                name: "web".to_string(),
                bytes: 200,
            },
            after,
        );

        let entry = stats.proxy_statistics.get_mut("web").unwrap();
        let days = entry.traffic_in.last_days(after.date_naive());
        assert_eq!(days[0], 200);
        assert_eq!(days[1], 100);
        assert!(days[2..].iter().all(|&v| v == 0));
        assert_eq!(entry.traffic_in.total(), 300);
    }
}
