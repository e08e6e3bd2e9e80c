use crate::error::ConfigError;
use crate::metrics::{EventKind, HistogramSink};
use crate::user::{UserContext, VirtualUser};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Pacing
// =============================================================================

/// Fixed interval between the starts of consecutive attempts of one user.
#[derive(Debug, Clone, Copy)]
pub struct ConstantPacing {
    interval: Duration,
}

impl ConstantPacing {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Time left to sleep after an attempt that took `elapsed`. Zero when the
    /// attempt overran the interval: the next one starts immediately.
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }
}

// =============================================================================
// Host
// =============================================================================

#[derive(Debug, Clone)]
pub struct HostPlan {
    pub users: usize,
    pub spawn_rate: f64,
    pub run_time: Duration,
    pub pacing: Duration,
    pub shutdown_grace: Duration,
}

/// Owns the virtual-user pool: schedules users, paces them and stops them.
pub struct LoadHost {
    plan: HostPlan,
    ctx: UserContext,
    metrics: Arc<HistogramSink>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl LoadHost {
    pub fn new(plan: HostPlan, ctx: UserContext, metrics: Arc<HistogramSink>) -> Self {
        let (shutdown, _) = broadcast::channel::<()>(1);
        Self {
            plan,
            ctx,
            metrics,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Starts the paced task loop for one user.
    pub fn schedule(&mut self, user: VirtualUser) {
        let pacing = ConstantPacing::new(self.plan.pacing);
        let metrics = Arc::clone(&self.metrics);
        let shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            metrics.active_users.fetch_add(1, Ordering::Relaxed);
            run_user(user, pacing, shutdown).await;
            metrics.active_users.fetch_sub(1, Ordering::Relaxed);
        });
        self.tasks.push(task);
    }

    /// Ramps up to the target user count, holds for the run time, then shuts down.
    pub async fn run(mut self) -> Result<(), ConfigError> {
        info!("Starting load test");
        info!("Target: {} users", self.plan.users);

        // Stage 1: Ramp up
        let stage_start = Instant::now();
        info!(
            "Stage 1: ramping to {} users at {:.2} users/s",
            self.plan.users, self.plan.spawn_rate
        );

        let mut spawned = 0;
        let mut last_log = Instant::now();

        while spawned < self.plan.users {
            let elapsed = stage_start.elapsed().as_secs_f64();
            let target_now = ((self.plan.spawn_rate * elapsed) as usize + 1).min(self.plan.users);

            while spawned < target_now {
                let user = match VirtualUser::new(spawned, self.ctx.clone()) {
                    Ok(user) => user,
                    Err(e) => {
                        error!("User {} failed to start: {}", spawned, e);
                        self.stop().await;
                        return Err(e);
                    }
                };
                spawned += 1;
                self.schedule(user);
            }

            if spawned < self.plan.users {
                sleep(Duration::from_millis(100)).await;
            }

            if last_log.elapsed() >= PROGRESS_INTERVAL {
                self.log_progress("Stage 1", spawned);
                last_log = Instant::now();
            }
        }

        info!(
            "Stage 1 complete: {} users spawned, {} active",
            spawned,
            self.metrics.active_users.load(Ordering::Relaxed)
        );

        // Stage 2: Hold
        let stage_start = Instant::now();
        info!(
            "Stage 2: holding at {} users for {}s",
            self.plan.users,
            self.plan.run_time.as_secs()
        );

        let mut last_log = Instant::now();
        while stage_start.elapsed() < self.plan.run_time {
            let left = self.plan.run_time.saturating_sub(stage_start.elapsed());
            sleep(left.min(Duration::from_millis(500))).await;

            if last_log.elapsed() >= PROGRESS_INTERVAL {
                self.log_progress("Stage 2", spawned);
                last_log = Instant::now();
            }
        }

        // Stage 3: Stop
        self.stop().await;
        Ok(())
    }

    fn log_progress(&self, stage: &str, spawned: usize) {
        info!(
            "{}: spawned={}, active={}, attempts={}, violations={}, errors={}",
            stage,
            spawned,
            self.metrics.active_users.load(Ordering::Relaxed),
            self.metrics.attempts.load(Ordering::Relaxed),
            self.metrics.count(EventKind::TotalViolation),
            self.metrics.count(EventKind::StreamError)
        );
    }

    /// Signals every user to stop after its current attempt and waits up to the grace period.
    pub async fn stop(&mut self) {
        info!("Stage 3: stopping users");
        self.shutdown.send(()).ok();

        let tasks = std::mem::take(&mut self.tasks);
        info!(
            "Waiting for graceful shutdown (max {}s)",
            self.plan.shutdown_grace.as_secs()
        );
        tokio::select! {
            _ = sleep(self.plan.shutdown_grace) => {
                info!("Graceful shutdown timeout reached");
            }
            _ = futures_util::future::join_all(tasks) => {
                info!("All users stopped before timeout");
            }
        }

        info!(
            "Stage 3 complete: {} active",
            self.metrics.active_users.load(Ordering::Relaxed)
        );
    }
}

/// Task loop of one user. Shutdown is observed between attempts and while
/// sleeping out the pacing interval, never in the middle of an attempt.
async fn run_user(user: VirtualUser, pacing: ConstantPacing, mut shutdown: broadcast::Receiver<()>) {
    debug!("User {} started", user.id());

    loop {
        if !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
            break;
        }

        let started = Instant::now();
        user.run_task().await;

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = sleep(pacing.remaining(started.elapsed())) => {}
        }
    }

    debug!("User {} stopped", user.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::PromptCorpus;
    use crate::request::RequestBuilder;
    use httpmock::prelude::*;
    use url::Url;

    #[test]
    fn pacing_sleeps_out_the_remainder() {
        let pacing = ConstantPacing::new(Duration::from_secs(1));
        assert_eq!(pacing.remaining(Duration::from_millis(300)), Duration::from_millis(700));
        assert_eq!(pacing.remaining(Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(pacing.remaining(Duration::from_secs(3)), Duration::ZERO);
    }

    fn context(server: &MockServer, metrics: Arc<HistogramSink>) -> UserContext {
        let url = Url::parse(&server.url("/chat")).unwrap();
        UserContext {
            corpus: Arc::new(PromptCorpus::new(50, Vec::new(), 1..=3)),
            builder: Arc::new(RequestBuilder::new(url, "gpt-4o-mini", None)),
            sink: metrics,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn run_spawns_users_and_stops_them() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat");
                then.status(200).body("data: {\"x\":1}\n\ndata: [DONE]\n\n");
            })
            .await;

        let metrics = Arc::new(HistogramSink::new().unwrap());
        let plan = HostPlan {
            users: 3,
            spawn_rate: 100.0,
            run_time: Duration::from_millis(600),
            pacing: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        };

        let host = LoadHost::new(plan, context(&server, metrics.clone()), metrics.clone());
        host.run().await.unwrap();

        assert_eq!(metrics.active_users.load(Ordering::Relaxed), 0);
        let totals = metrics.count(EventKind::Total);
        assert!(totals >= 3, "expected at least one attempt per user, got {totals}");
        assert_eq!(metrics.count(EventKind::FirstToken), totals);
        assert_eq!(metrics.count(EventKind::StreamError), 0);
    }
}
