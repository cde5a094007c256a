pub mod metrics;

use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use self::metrics::Metrics;

static LOG_INIT: OnceCell<()> = OnceCell::new();

/// Telemetry（構造化ログとメトリクス）を管理する構造体。
#[derive(Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// ログ出力を初期化し、専用レジストリにメトリクスを登録する。
    ///
    /// サブスクライバの設定はプロセスにつき一度だけ行われる。二つ目以降の
    /// インスタンスは自前のメトリクスレジストリだけを持つ。
    pub fn new() -> Result<Self> {
        init_logging()?;
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new(&registry)?);
        Ok(Self { registry, metrics })
    }

    /// メトリクスへのアクセスを提供する。
    pub fn metrics_arc(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// ライブプローブを記録する。
    pub fn record_live_probe(&self) {
        tracing::debug!("service live probe");
    }

    /// 準備完了プローブを記録する。
    pub fn record_ready_probe(&self) {
        tracing::info!("service ready probe recorded");
    }

    /// Prometheusメトリクスをレンダリングする。
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// JSON 形式の構造化ログを設定する。フィルタは `RUST_LOG`、既定は `info`。
fn init_logging() -> Result<()> {
    LOG_INIT.get_or_try_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false).json())
            .try_init()
            .map_err(|error| anyhow::anyhow!("failed to install tracing subscriber: {error}"))
    })?;
    Ok(())
}
