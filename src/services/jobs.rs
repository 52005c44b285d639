//! Periodic background jobs: due reminders, plan reminders, reconciliation

use std::future::Future;
use std::time::Duration;

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use super::Services;
use crate::{
    config::JobsConfig,
    error::{AppError, AppResult},
};

/// Run `job` every `period` until `shutdown` flips; the first run waits one period
fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Job {} scheduled every {:?}", name, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!("Job {} running", name);
                    job().await;
                }
                _ = shutdown.changed() => {
                    tracing::info!("Job {} stopped", name);
                    break;
                }
            }
        }
    })
}

/// Start every job; each handle ends once `shutdown` is signalled
pub fn spawn_all(
    services: &Services,
    config: &JobsConfig,
    shutdown: watch::Receiver<bool>,
) -> AppResult<Vec<JoinHandle<()>>> {
    if !config.enabled {
        tracing::info!("Background jobs disabled");
        return Ok(Vec::new());
    }
    config
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let notifications = services.notifications.clone();
    let due = every(
        "due-reminders",
        Duration::from_secs(config.due_sweep_interval_secs),
        shutdown.clone(),
        move || {
            let notifications = notifications.clone();
            async move {
                match notifications.send_due_reminders().await {
                    Ok(delivery) => tracing::info!("Due reminders: {:?}", delivery),
                    Err(e) => tracing::error!("Due reminder job failed: {}", e),
                }
            }
        },
    );

    let notifications = services.notifications.clone();
    let plans = every(
        "subscription-reminders",
        Duration::from_secs(config.subscription_sweep_interval_secs),
        shutdown.clone(),
        move || {
            let notifications = notifications.clone();
            async move {
                match notifications.send_subscription_reminders().await {
                    Ok(delivery) => tracing::info!("Subscription reminders: {:?}", delivery),
                    Err(e) => tracing::error!("Subscription reminder job failed: {}", e),
                }
            }
        },
    );

    let reconciler = services.reconciler.clone();
    let reconcile = every(
        "reconcile",
        Duration::from_secs(config.reconcile_interval_secs),
        shutdown,
        move || {
            let reconciler = reconciler.clone();
            async move {
                if let Err(e) = reconciler.run().await {
                    tracing::error!("Reconciliation failed: {}", e);
                }
            }
        },
    );

    Ok(vec![due, plans, reconcile])
}
