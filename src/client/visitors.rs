/// 访问者集合管理
///
/// 客户端可以配置若干访问者（通过服务器的会合机制访问其它客户端
/// 暴露的服务）。管理器持有配置集合：`reload` 按结构比较新旧配置，
/// 先拆除被删除或被修改的条目再启动新增条目；后台扫描周期性拉起
/// 意外退出的访问者。
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 访问者配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorConfig {
    /// 本地名称
    pub name: String,
    /// 要访问的远端代理名
    pub server_name: String,
    /// 共享密钥，必须与远端代理一致
    #[serde(default)]
    pub sk: String,
    /// 本地监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 本地监听端口
    pub bind_port: u16,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

/// 访问者能力集合
#[async_trait]
pub trait Visitor: Send + Sync {
    async fn run(&self) -> Result<()>;
    async fn close(&self);
}

/// 访问者构造器，由具体的访问者实现方注入
pub type VisitorFactory = Arc<dyn Fn(&VisitorConfig) -> Arc<dyn Visitor> + Send + Sync>;

struct Inner {
    cfgs: HashMap<String, VisitorConfig>,
    visitors: HashMap<String, Arc<dyn Visitor>>,
}

/// 访问者集合管理器
pub struct VisitorManager {
    factory: VisitorFactory,
    inner: Mutex<Inner>,
    check_interval: Duration,
    cancel: CancellationToken,
}

impl VisitorManager {
    pub fn new(factory: VisitorFactory) -> Self {
        Self {
            factory,
            inner: Mutex::new(Inner {
                cfgs: HashMap::new(),
                visitors: HashMap::new(),
            }),
            check_interval: Duration::from_secs(10),
            cancel: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    fn with_check_interval(factory: VisitorFactory, check_interval: Duration) -> Self {
        Self {
            factory,
            inner: Mutex::new(Inner {
                cfgs: HashMap::new(),
                visitors: HashMap::new(),
            }),
            check_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// 周期扫描，拉起配置里有但没在运行的访问者
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.check_interval) => {}
            }

            // 扫描缺失项时不持锁启动，访问者的 run 可能阻塞
            let missing: Vec<VisitorConfig> = {
                let inner = self.inner.lock().await;
                inner
                    .cfgs
                    .values()
                    .filter(|cfg| !inner.visitors.contains_key(&cfg.name))
                    .cloned()
                    .collect()
            };

            for cfg in missing {
                info!("try to start visitor [{}]", cfg.name);
                self.start_visitor(cfg).await;
            }
        }
    }

    async fn start_visitor(&self, cfg: VisitorConfig) {
        let name = cfg.name.clone();
        let visitor = (self.factory)(&cfg);
        match visitor.run().await {
            Ok(()) => {
                info!("start visitor [{}] success", name);
                let mut inner = self.inner.lock().await;
                // 配置在启动期间被移除时不再登记
                if inner.cfgs.contains_key(&name) {
                    inner.visitors.insert(name, visitor);
                } else {
                    visitor.close().await;
                }
            }
            Err(e) => {
                warn!("start visitor [{}] error: {}", name, e);
            }
        }
    }

    /// 应用一套新的访问者配置
    ///
    /// 被删除或内容有变化的条目先关闭，再启动新增条目；完全相同的
    /// 配置集不做任何事。
    pub async fn reload(&self, new_cfgs: HashMap<String, VisitorConfig>) {
        let (removed, added) = {
            let mut inner = self.inner.lock().await;

            let mut removed = Vec::new();
            let old_names: Vec<String> = inner.cfgs.keys().cloned().collect();
            for name in old_names {
                let stale = match new_cfgs.get(&name) {
                    None => true,
                    Some(new_cfg) => inner.cfgs.get(&name) != Some(new_cfg),
                };
                if stale {
                    inner.cfgs.remove(&name);
                    if let Some(visitor) = inner.visitors.remove(&name) {
                        visitor.close().await;
                    }
                    removed.push(name);
                }
            }

            let mut added = Vec::new();
            for (name, cfg) in &new_cfgs {
                if !inner.cfgs.contains_key(name) {
                    inner.cfgs.insert(name.clone(), cfg.clone());
                    added.push(cfg.clone());
                }
            }
            (removed, added)
        };

        if !removed.is_empty() {
            info!("visitor removed: {:?}", removed);
        }
        if !added.is_empty() {
            info!(
                "visitor added: {:?}",
                added.iter().map(|c| c.name.clone()).collect::<Vec<_>>()
            );
        }
        for cfg in added {
            self.start_visitor(cfg).await;
        }
    }

    /// 关闭全部访问者
    pub async fn close(&self) {
        self.cancel.cancel();
        let visitors: Vec<Arc<dyn Visitor>> = {
            let mut inner = self.inner.lock().await;
            inner.cfgs.clear();
            inner.visitors.drain().map(|(_, v)| v).collect()
        };
        for visitor in visitors {
            visitor.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockVisitor {
        runs: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Visitor for MockVisitor {
        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_factory() -> (VisitorFactory, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (runs_c, closes_c) = (runs.clone(), closes.clone());
        let factory: VisitorFactory = Arc::new(move |_cfg| {
            Arc::new(MockVisitor {
                runs: runs_c.clone(),
                closes: closes_c.clone(),
            }) as Arc<dyn Visitor>
        });
        (factory, runs, closes)
    }

    fn cfg(name: &str, port: u16) -> VisitorConfig {
        VisitorConfig {
            name: name.to_string(),
            server_name: format!("remote-{}", name),
            sk: "sk".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            bind_port: port,
        }
    }

    fn cfg_map(cfgs: &[VisitorConfig]) -> HashMap<String, VisitorConfig> {
        cfgs.iter().map(|c| (c.name.clone(), c.clone())).collect()
    }

    #[tokio::test]
    async fn test_reload_starts_new_visitors() {
        let (factory, runs, _closes) = counting_factory();
        let manager = VisitorManager::new(factory);

        manager.reload(cfg_map(&[cfg("a", 1000), cfg("b", 1001)])).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_identical_reload_is_noop() {
        let (factory, runs, closes) = counting_factory();
        let manager = VisitorManager::new(factory);

        let cfgs = cfg_map(&[cfg("a", 1000), cfg("b", 1001)]);
        manager.reload(cfgs.clone()).await;
        manager.reload(cfgs).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_modified_entry_torn_down_then_restarted() {
        let (factory, runs, closes) = counting_factory();
        let manager = VisitorManager::new(factory);

        manager.reload(cfg_map(&[cfg("a", 1000)])).await;
        // 同名不同端口视为修改
        manager.reload(cfg_map(&[cfg("a", 2000)])).await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_removed_entry_closed() {
        let (factory, _runs, closes) = counting_factory();
        let manager = VisitorManager::new(factory);

        manager.reload(cfg_map(&[cfg("a", 1000), cfg("b", 1001)])).await;
        manager.reload(cfg_map(&[cfg("a", 1000)])).await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scan_restarts_dead_visitor() {
        let (factory, runs, _closes) = counting_factory();
        let manager = Arc::new(VisitorManager::with_check_interval(
            factory,
            Duration::from_millis(50),
        ));

        manager.reload(cfg_map(&[cfg("a", 1000)])).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // 模拟访问者意外退出
        manager.inner.lock().await.visitors.remove("a");

        let scan = tokio::spawn(manager.clone().run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.close().await;
        let _ = scan.await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
