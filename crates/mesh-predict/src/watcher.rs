//! Trainer readiness and model metadata polling

use mesh_core::{ModelArtifactRef, Result, TrainerClient, TrainerConfig};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Keeps the latest model artifact reference and trainer readiness
///
/// Purely observational; scheduling never reads it.
pub struct TrainerWatcher {
    trainer: Arc<dyn TrainerClient>,
    model_name: String,
    poll_interval: Duration,
    current: RwLock<Option<ModelArtifactRef>>,
    ready: AtomicBool,
}

impl TrainerWatcher {
    pub fn new(trainer: Arc<dyn TrainerClient>, config: &TrainerConfig) -> Self {
        Self {
            trainer,
            model_name: config.model_name.clone(),
            poll_interval: config.poll_interval(),
            current: RwLock::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Latest known model artifact
    pub fn current(&self) -> Option<ModelArtifactRef> {
        self.current.read().clone()
    }

    /// Trainer readiness as of the last poll
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Poll readiness and metadata once
    pub async fn poll_once(&self) -> Result<()> {
        let ready = match self.trainer.ready().await {
            Ok(ready) => ready,
            Err(e) => {
                self.ready.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.ready.store(ready, Ordering::Relaxed);
        if !ready {
            debug!("Trainer not ready, skipping model metadata");
            return Ok(());
        }

        let info = self.trainer.model_info(&self.model_name).await?;
        let mut current = self.current.write();
        let changed = current.as_ref().map_or(true, |c| c.version != info.version);
        if changed {
            info!(
                model = %self.model_name,
                version = %info.version,
                sample_count = info.sample_count,
                "Forecasting model updated"
            );
            *current = Some(ModelArtifactRef::from_info(self.model_name.clone(), &info));
        }
        Ok(())
    }

    /// Poll on an interval until shutdown is signalled
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            warn!(model = %self.model_name, error = %e, "Trainer poll failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Trainer watcher stopped");
        })
    }
}
