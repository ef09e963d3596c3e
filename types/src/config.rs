//! Configuration knobs the core recognises.

use std::time::Duration;

use clap::Parser;

/// Timing and reproducibility options for a simulation run. All durations are
/// in milliseconds; accessors return [`Duration`]s.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// Exclusive upper bound of the uniform random delay injected on every
    /// send. Zero disables the delay shim entirely.
    #[clap(long, env = "LAMINA_NETWORK_DELAY_MS", default_value = "20")]
    pub network_delay_ms: u64,

    /// How long a client waits for a response before giving up on a request.
    #[clap(long, env = "LAMINA_CLIENT_TIMEOUT_MS", default_value = "2000")]
    pub client_timeout_ms: u64,

    /// How long a cache waits for an upstream response before propagating a
    /// failure downward.
    #[clap(long, env = "LAMINA_REQUEST_TIMEOUT_MS", default_value = "1000")]
    pub request_timeout_ms: u64,

    /// How long the database (and each L1 collecting its L2 votes) waits for
    /// a critical-write round before aborting it.
    #[clap(long, env = "LAMINA_CRIT_WRITE_TIMEOUT_MS", default_value = "500")]
    pub crit_write_timeout_ms: u64,

    /// How long a crashed cache stays down before its cold restart.
    #[clap(long, env = "LAMINA_RECOVERY_DELAY_MS", default_value = "500")]
    pub recovery_delay_ms: u64,

    /// Master seed for the per-link RNGs. A fixed seed reproduces a run.
    #[clap(long, env = "LAMINA_SEED", default_value = "0")]
    pub seed: u64,

    /// Capacity of the observable event broadcast channel.
    #[clap(long, env = "LAMINA_EVENTS_CHANNEL_CAPACITY", default_value = "4096")]
    pub events_channel_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self::parse_from(std::iter::empty::<String>())
    }
}

impl Options {
    pub fn network_delay(&self) -> Duration {
        Duration::from_millis(self.network_delay_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn crit_write_timeout(&self) -> Duration {
        Duration::from_millis(self.crit_write_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_keep_the_timeout_ladder_ordered() {
        let opt = Options::default();
        // A cache gives up before its client does, and a critical-write round
        // resolves before the caches waiting on it give up.
        assert!(opt.crit_write_timeout() < opt.request_timeout());
        assert!(opt.request_timeout() < opt.client_timeout());
    }
}
