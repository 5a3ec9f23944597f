use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::ConnectionSettings;
use crate::services::connection::Connection;

/// Periodic liveness probe for one connection.
///
/// The period is `delay` scaled by a random factor in `1 ± offset/100`, drawn once
/// so that connections opened together do not ping in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    period: Duration,
}

impl Heartbeat {
    pub fn new(settings: &ConnectionSettings) -> Self {
        let offset = settings.heartbeat_offset.clamp(0.0, 99.0);
        let factor = if offset > 0.0 {
            1.0 + rand::rng().random_range(-offset..=offset) / 100.0
        } else {
            1.0
        };
        Self {
            period: settings.heartbeat_delay.mul_f64(factor),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks until the connection is destroyed or dropped. The first tick fires one
    /// period after start.
    pub fn start(self, connection: &Arc<Connection>) -> JoinHandle<()> {
        let connection = Arc::downgrade(connection);
        let period = self.period;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                if connection.is_destroyed() {
                    return;
                }
                connection.heartbeat();
            }
        })
    }
}
