pub mod metrics;
pub mod tracing;

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};

pub use self::metrics::Metrics;
pub use self::tracing::LogFormat;

/// Telemetry（メトリクスとトレーシング）を管理する構造体。
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// トレーシングを初期化し、専用レジストリにメトリクスを登録する。
    pub fn new(format: LogFormat) -> Result<Self> {
        tracing::init(format)?;
        Self::without_tracing()
    }

    /// メトリクスのみ。テストや組み込み用途向け。
    pub fn without_tracing() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new(Arc::clone(&registry))?);
        Ok(Self { registry, metrics })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Prometheusメトリクスをレンダリングする。
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn write_prometheus(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render_prometheus())
            .with_context(|| format!("failed to write metrics to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_metrics() {
        let telemetry = Telemetry::without_tracing().expect("metrics register");
        telemetry.metrics().tasks_completed.inc();
        telemetry
            .metrics()
            .task_map
            .with_label_values(&["voc_msrn"])
            .set(0.91);

        let rendered = telemetry.render_prometheus();
        assert!(rendered.contains("mlc_eval_tasks_completed_total 1"), "{rendered}");
        assert!(rendered.contains("mlc_eval_task_map{task=\"voc_msrn\"} 0.91"), "{rendered}");
    }

    #[test]
    fn separate_instances_do_not_collide() {
        let first = Telemetry::without_tracing().expect("first");
        let second = Telemetry::without_tracing().expect("second");
        first.metrics().tasks_failed.inc();
        assert!(!second.render_prometheus().contains("mlc_eval_tasks_failed_total 1"));
    }
}
