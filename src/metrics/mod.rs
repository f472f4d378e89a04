//! # Prometheus 指标
//!
//! 注册表由调用方注入，便于同一进程内多个实例或测试隔离。

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// 实时消息核心指标
pub struct RealtimeMetrics {
    /// 本节点活跃连接数
    pub connections_active: IntGauge,
    /// 累计接入连接数
    pub connections_accepted_total: IntCounter,
    /// 订阅结果
    pub subscriptions_total: IntCounterVec,
    /// 投递次数（按投递类型）
    pub dispatch_total: IntCounterVec,
    /// 目标投递失败次数
    pub dispatch_target_failures_total: IntCounter,
    /// 兜底路由次数
    pub routing_fallback_total: IntCounter,
    /// 心跳超时清理的会话数
    pub sweeper_expired_sessions_total: IntCounter,
    /// 会话存储调用失败次数（按错误类型）
    pub store_errors_total: IntCounterVec,
    /// 投递耗时（秒）
    pub dispatch_duration_seconds: Histogram,
}

impl RealtimeMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_active = IntGauge::with_opts(Opts::new(
            "realtime_connections_active",
            "Number of live connections owned by this node",
        ))?;
        let connections_accepted_total = IntCounter::with_opts(Opts::new(
            "realtime_connections_accepted_total",
            "Total number of accepted connections",
        ))?;
        let subscriptions_total = IntCounterVec::new(
            Opts::new("realtime_subscriptions_total", "Subscription requests by outcome"),
            &["outcome"],
        )?;
        let dispatch_total = IntCounterVec::new(
            Opts::new("realtime_dispatch_total", "Dispatched messages by dispatch type"),
            &["dispatch_type"],
        )?;
        let dispatch_target_failures_total = IntCounter::with_opts(Opts::new(
            "realtime_dispatch_target_failures_total",
            "Total number of failed delivery targets",
        ))?;
        let routing_fallback_total = IntCounter::with_opts(Opts::new(
            "realtime_routing_fallback_total",
            "Messages routed through the static fallback table",
        ))?;
        let sweeper_expired_sessions_total = IntCounter::with_opts(Opts::new(
            "realtime_sweeper_expired_sessions_total",
            "Sessions removed by the heartbeat sweeper",
        ))?;
        let store_errors_total = IntCounterVec::new(
            Opts::new("realtime_store_errors_total", "Failed session store calls by kind"),
            &["kind"],
        )?;
        let dispatch_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "realtime_dispatch_duration_seconds",
                "Dispatch duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connections_accepted_total.clone()))?;
        registry.register(Box::new(subscriptions_total.clone()))?;
        registry.register(Box::new(dispatch_total.clone()))?;
        registry.register(Box::new(dispatch_target_failures_total.clone()))?;
        registry.register(Box::new(routing_fallback_total.clone()))?;
        registry.register(Box::new(sweeper_expired_sessions_total.clone()))?;
        registry.register(Box::new(store_errors_total.clone()))?;
        registry.register(Box::new(dispatch_duration_seconds.clone()))?;

        Ok(Self {
            connections_active,
            connections_accepted_total,
            subscriptions_total,
            dispatch_total,
            dispatch_target_failures_total,
            routing_fallback_total,
            sweeper_expired_sessions_total,
            store_errors_total,
            dispatch_duration_seconds,
        })
    }

    /// 使用独立注册表创建（测试与单机场景）
    pub fn standalone() -> Self {
        Self::new(&Registry::new()).expect("Failed to register realtime metrics")
    }
}
