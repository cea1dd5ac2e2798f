use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Error;

/// Connection settings for a NATS client.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct NatsConnectionConfig {
    /// Server URL, or a comma-separated list of them.
    pub url: String,

    /// Client name reported to the server.
    pub name: String,

    /// Reconnect attempts before giving up. `None` retries forever.
    pub max_reconnects: Option<usize>,

    /// Base delay between reconnect attempts.
    pub reconnect_wait: Duration,

    /// Upper bound of the random delay added to `reconnect_wait`.
    pub reconnect_jitter: Duration,

    /// Upper bound of the random delay added to `reconnect_wait` for TLS connections.
    pub reconnect_jitter_tls: Duration,

    /// Timeout for establishing a connection.
    pub connection_timeout: Duration,

    /// Timeout for requests, including liveness checks.
    pub request_timeout: Duration,

    /// Interval between liveness checks.
    pub ping_interval: Duration,

    /// Unanswered checks after which the connection is considered stale and re-established.
    pub max_pings_outstanding: usize,

    /// Whether the connection must use TLS.
    pub tls_required: bool,
}

impl Default for NatsConnectionConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: "courier".to_string(),
            max_reconnects: Some(60),
            reconnect_wait: Duration::from_secs(2),
            reconnect_jitter: Duration::from_millis(100),
            reconnect_jitter_tls: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(2 * 60),
            max_pings_outstanding: 2,
            tls_required: false,
        }
    }
}

impl NatsConnectionConfig {
    /// Whether the link is TLS, either required explicitly or implied by a `tls://` URL.
    #[must_use]
    pub fn uses_tls(&self) -> bool {
        self.tls_required || self.url.starts_with("tls://")
    }

    fn jitter_bound(&self) -> Duration {
        if self.uses_tls() {
            self.reconnect_jitter_tls
        } else {
            self.reconnect_jitter
        }
    }
}

/// Delay before reconnect attempt number `attempts`.
///
/// The first attempt is immediate; later ones wait `wait` shifted by up to `jitter` in
/// either direction, never below zero.
#[must_use]
pub fn reconnect_delay(attempts: usize, wait: Duration, jitter: Duration) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }

    let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX / 2);
    let offset = Duration::from_millis(fastrand::u64(0..=jitter_millis.saturating_mul(2)));

    (wait + offset).saturating_sub(jitter)
}

/// An open client plus the background liveness check watching it.
///
/// Dropping the connection stops the liveness check; the client closes once its last clone
/// is dropped.
#[derive(Debug)]
pub struct NatsConnection {
    client: Client,
    shutdown: CancellationToken,
}

impl NatsConnection {
    /// The client handle.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Stops the liveness check, then drains the client: subscriptions stop, buffered messages are
    /// flushed and the connection closes.
    pub async fn close(self) {
        self.shutdown.cancel();

        if let Err(e) = self.client.drain().await {
            warn!(error = %e, "failed to drain NATS connection");
        }
    }
}

impl Drop for NatsConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connects to NATS with reconnect jitter, connection event logging and a liveness check.
///
/// # Errors
///
/// Returns [`Error::Connect`] if the initial connection fails.
#[instrument(skip(config), fields(url = %config.url, name = %config.name))]
pub async fn connect(config: &NatsConnectionConfig) -> Result<NatsConnection, Error> {
    let wait = config.reconnect_wait;
    let jitter = config.jitter_bound();

    let client = ConnectOptions::new()
        .name(&config.name)
        .max_reconnects(config.max_reconnects)
        .reconnect_delay_callback(move |attempts| reconnect_delay(attempts, wait, jitter))
        .connection_timeout(config.connection_timeout)
        .request_timeout(Some(config.request_timeout))
        .ping_interval(config.ping_interval)
        .require_tls(config.uses_tls())
        .event_callback(|event| async move {
            match event {
                Event::Connected => info!("connected to NATS"),
                Event::Disconnected => warn!("disconnected from NATS"),
                Event::Closed => error!("NATS connection closed"),
                Event::ClientError(e) => error!(error = %e, "NATS client error"),
                Event::ServerError(e) => error!(error = %e, "NATS server error"),
                other => debug!(event = %other, "NATS connection event"),
            }
        })
        .connect(config.url.as_str())
        .await?;

    info!("connected");

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_liveness(
        client.clone(),
        config.ping_interval,
        config.request_timeout,
        config.max_pings_outstanding.max(1),
        shutdown.clone(),
    ));

    Ok(NatsConnection { client, shutdown })
}

async fn watch_liveness(
    client: Client,
    interval: Duration,
    timeout: Duration,
    max_outstanding: usize,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut outstanding = 0;

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match tokio::time::timeout(timeout, client.flush()).await {
            Ok(Ok(())) => outstanding = 0,
            Ok(Err(e)) => {
                outstanding += 1;
                warn!(error = %e, outstanding, "liveness check failed");
            }
            Err(_) => {
                outstanding += 1;
                warn!(outstanding, timeout = ?timeout, "liveness check timed out");
            }
        }

        if outstanding >= max_outstanding {
            warn!(outstanding, "connection looks stale, forcing reconnect");
            if let Err(e) = client.force_reconnect().await {
                error!(error = %e, "failed to force reconnect");
            }
            outstanding = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reconnect_is_immediate() {
        assert_eq!(
            reconnect_delay(0, Duration::from_secs(2), Duration::from_millis(100)),
            Duration::ZERO
        );
    }

    #[test]
    fn reconnect_delay_stays_within_jitter() {
        let wait = Duration::from_secs(2);
        let jitter = Duration::from_millis(100);

        for attempts in 1..200 {
            let delay = reconnect_delay(attempts, wait, jitter);
            assert!(delay >= wait - jitter);
            assert!(delay <= wait + jitter);
        }
    }

    #[test]
    fn jitter_larger_than_wait_clamps_at_zero() {
        for attempts in 1..200 {
            let delay = reconnect_delay(attempts, Duration::ZERO, Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(50));
        }
    }

    #[test]
    fn zero_jitter_waits_exactly() {
        assert_eq!(
            reconnect_delay(3, Duration::from_secs(2), Duration::ZERO),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn tls_url_selects_tls_jitter() {
        let config = NatsConnectionConfig {
            url: "tls://nats.example.com:4222".to_string(),
            ..NatsConnectionConfig::default()
        };

        assert!(config.uses_tls());
        assert_eq!(config.jitter_bound(), Duration::from_secs(1));
    }

    #[test]
    fn tls_flag_selects_tls_jitter() {
        let config = NatsConnectionConfig {
            tls_required: true,
            ..NatsConnectionConfig::default()
        };

        assert_eq!(config.jitter_bound(), Duration::from_secs(1));
    }

    #[test]
    fn plain_link_uses_plain_jitter() {
        let config = NatsConnectionConfig::default();

        assert!(!config.uses_tls());
        assert_eq!(config.jitter_bound(), Duration::from_millis(100));
    }

    #[test]
    fn defaults() {
        let config = NatsConnectionConfig::default();

        assert_eq!(config.max_reconnects, Some(60));
        assert_eq!(config.reconnect_wait, Duration::from_secs(2));
        assert_eq!(config.reconnect_jitter, Duration::from_millis(100));
        assert_eq!(config.reconnect_jitter_tls, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.ping_interval, Duration::from_secs(120));
        assert_eq!(config.max_pings_outstanding, 2);
    }
}
