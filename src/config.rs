use std::time::Duration;

use anyhow::{Context, Result};

/// Settings shared by every aggregate instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
  /// A snapshot is stored every this many persisted events. Zero disables snapshots.
  pub snapshot_interval: u64,
  /// How often unconfirmed deliveries are sent again.
  pub redelivery_interval: Duration,
  /// Pause before an aggregate recovers after failing to persist.
  pub restart_backoff: Duration,
  /// How long the processor waits for a transfer to finish.
  pub settle_timeout: Duration,
}

impl Default for LedgerConfig {
  fn default() -> Self {
    Self {
      snapshot_interval: 100,
      redelivery_interval: Duration::from_millis(500),
      restart_backoff: Duration::from_millis(100),
      settle_timeout: Duration::from_secs(5),
    }
  }
}

impl LedgerConfig {
  /// The default settings, overridden by the `LEDGER_*` environment variables that are set.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();
    if let Some(value) = lookup("LEDGER_SNAPSHOT_INTERVAL") {
      config.snapshot_interval = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid LEDGER_SNAPSHOT_INTERVAL: {}", value))?;
    }
    if let Some(value) = lookup("LEDGER_REDELIVERY_INTERVAL_MS") {
      config.redelivery_interval = parse_millis("LEDGER_REDELIVERY_INTERVAL_MS", &value)?;
    }
    if let Some(value) = lookup("LEDGER_RESTART_BACKOFF_MS") {
      config.restart_backoff = parse_millis("LEDGER_RESTART_BACKOFF_MS", &value)?;
    }
    if let Some(value) = lookup("LEDGER_SETTLE_TIMEOUT_MS") {
      config.settle_timeout = parse_millis("LEDGER_SETTLE_TIMEOUT_MS", &value)?;
    }
    Ok(config)
  }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
  let millis: u64 = value
    .trim()
    .parse()
    .with_context(|| format!("Invalid {}: {}", key, value))?;
  if millis == 0 {
    anyhow::bail!("{} must be greater than zero", key);
  }
  Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {

  use std::collections::HashMap;

  use super::*;

  fn lookup(vars: Vec<(&'static str, &'static str)>) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<&str, &str> = vars.into_iter().collect();
    move |key: &str| vars.get(key).map(|value| value.to_string())
  }

  #[test]
  fn defaults_without_variables() {
    let config = LedgerConfig::from_lookup(lookup(vec![])).unwrap();

    assert_eq!(config, LedgerConfig::default());
    assert_eq!(config.snapshot_interval, 100);
  }

  #[test]
  fn variables_override_defaults() {
    let config = LedgerConfig::from_lookup(lookup(vec![
      ("LEDGER_SNAPSHOT_INTERVAL", "10"),
      ("LEDGER_REDELIVERY_INTERVAL_MS", " 50 "),
      ("LEDGER_SETTLE_TIMEOUT_MS", "1000"),
    ]))
    .unwrap();

    assert_eq!(
      config,
      LedgerConfig {
        snapshot_interval: 10,
        redelivery_interval: Duration::from_millis(50),
        restart_backoff: Duration::from_millis(100),
        settle_timeout: Duration::from_secs(1),
      }
    );
  }

  #[test]
  fn invalid_values() {
    let cases = vec![
      ("LEDGER_SNAPSHOT_INTERVAL", "-1"),
      ("LEDGER_REDELIVERY_INTERVAL_MS", "soon"),
      ("LEDGER_RESTART_BACKOFF_MS", "0"),
    ];

    for (key, value) in cases {
      let result = LedgerConfig::from_lookup(lookup(vec![(key, value)]));
      assert!(result.is_err(), "{}={} should be rejected", key, value);
    }
  }
}
