use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{BaseProxy, Proxy};
use crate::config::{HttpsProxyConfig, ProxyType};
use crate::error::Result;
use crate::server::vhost::{canonical_addr, VhostRouteConfig};

/// HTTPS 代理：按域名向 vhost 复用器注册路由，不占用独立端口
pub struct HttpsProxy {
    base: Arc<BaseProxy>,
    cfg: HttpsProxyConfig,
}

impl HttpsProxy {
    pub fn new(base: Arc<BaseProxy>, cfg: HttpsProxyConfig) -> Self {
        Self { base, cfg }
    }
}

#[async_trait]
impl Proxy for HttpsProxy {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Https
    }

    async fn run(self: Arc<Self>) -> Result<String> {
        let mut route = VhostRouteConfig::default();
        let mut addrs = Vec::new();

        for domain in &self.cfg.custom_domains {
            if domain.is_empty() {
                continue;
            }
            route.domain = domain.clone();
            let mut listener = self.base.rc.vhost_https_muxer.listen(&route)?;
            listener.add_log_prefix(&self.base.name);
            info!(
                "https proxy '{}' listen for host [{}]",
                self.base.name, route.domain
            );
            self.base.clone().start_vhost_listen_handler(listener);
            addrs.push(canonical_addr(domain, self.base.env.vhost_https_port));
        }

        if !self.cfg.sub_domain.is_empty() {
            route.domain = format!("{}.{}", self.cfg.sub_domain, self.base.env.subdomain_host);
            let mut listener = self.base.rc.vhost_https_muxer.listen(&route)?;
            listener.add_log_prefix(&self.base.name);
            info!(
                "https proxy '{}' listen for host [{}]",
                self.base.name, route.domain
            );
            addrs.push(canonical_addr(&route.domain, self.base.env.vhost_https_port));
            self.base.clone().start_vhost_listen_handler(listener);
        }

        Ok(addrs.join(","))
    }

    async fn close(&self) {
        self.base.close_base().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::test_context;
    use super::*;
    use crate::config::{ProxyConfig, ProxyKind};

    fn make_proxy(
        ctx: &super::super::ProxyContext,
        name: &str,
        domains: &[&str],
        sub_domain: &str,
    ) -> Arc<HttpsProxy> {
        let https_cfg = HttpsProxyConfig {
            custom_domains: domains.iter().map(|d| d.to_string()).collect(),
            sub_domain: sub_domain.to_string(),
        };
        let cfg = ProxyConfig {
            name: name.to_string(),
            use_encryption: false,
            use_compression: false,
            kind: ProxyKind::Https(https_cfg.clone()),
        };
        let base = Arc::new(BaseProxy::new(ctx, &cfg));
        Arc::new(HttpsProxy::new(base, https_cfg))
    }

    #[tokio::test]
    async fn test_advertises_canonical_addrs() {
        let ctx = test_context();
        let proxy = make_proxy(&ctx, "site", &["a.example.com", "b.example.com"], "");

        let addr = proxy.clone().run().await.unwrap();
        assert_eq!(addr, "a.example.com,b.example.com");
        proxy.close().await;
    }

    #[tokio::test]
    async fn test_sub_domain_route() {
        let mut ctx = test_context();
        let env = Arc::make_mut(&mut ctx.env);
        env.subdomain_host = "tunnel.example.com".to_string();
        env.vhost_https_port = 8443;

        let proxy = make_proxy(&ctx, "site", &[], "app");
        let addr = proxy.clone().run().await.unwrap();
        assert_eq!(addr, "app.tunnel.example.com:8443");
        proxy.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_domain_fails() {
        let ctx = test_context();
        let first = make_proxy(&ctx, "one", &["dup.example.com"], "");
        first.clone().run().await.unwrap();

        let second = make_proxy(&ctx, "two", &["dup.example.com"], "");
        assert!(second.clone().run().await.is_err());

        first.close().await;
    }
}
