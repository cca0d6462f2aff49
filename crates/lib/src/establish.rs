//! Waiting for CustomResourceDefinitions to become usable.
//!
//! The API server accepts a CRD immediately but only serves its kind once
//! the `Established` condition turns true. Each attempt walks a small state
//! machine:
//!
//! ```text
//! Absent -> Creating -> PollingEstablished -> Established
//!                               |
//!                               +-> Failed (timeout)
//! ```
//!
//! An object that already exists skips straight to polling. Polling keeps
//! going through not-found results, missing conditions and fetch errors
//! until the deadline. A failed attempt is retried from the top, because a
//! create that raced another actor only resolves after a fresh look.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apply::{ApplyError, ApplyOutcome, ResourceHandler};
use crate::client::{ClientCacheEntry, ClientError, ClientProvider, ObjectClient};
use crate::decode::decode_typed;
use crate::error::Operation;
use crate::render::{Render, RenderParams, render_manifest};

const ESTABLISHED: &str = "Established";
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Where one establishment attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishState {
  Absent,
  Creating,
  PollingEstablished,
  Established,
  Failed,
}

/// Poll cadence and retry bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstablishPolicy {
  #[serde(with = "crate::config::duration")]
  pub interval: Duration,
  #[serde(with = "crate::config::duration")]
  pub timeout: Duration,
  /// Create-and-poll cycles before giving up. Zero counts as one.
  pub attempts: u32,
}

impl Default for EstablishPolicy {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(5),
      timeout: Duration::from_secs(10 * 60),
      attempts: 3,
    }
  }
}

#[derive(Debug, Error)]
pub enum EstablishError {
  #[error("CustomResourceDefinition {name} not established within {timeout:?}, last observed: {last_observed}")]
  Timeout {
    name: String,
    timeout: Duration,
    last_observed: String,
  },

  #[error("cancelled while waiting for CustomResourceDefinition to be established")]
  Cancelled,

  #[error("CustomResourceDefinition has no name")]
  MissingName,
}

/// Create `required` if needed and wait until it is established, retrying
/// the whole cycle up to `policy.attempts` times.
///
/// The error of the final attempt is returned, so a timeout stays a
/// timeout. Cancellation is never retried.
pub async fn establish(
  client: &dyn ObjectClient<CustomResourceDefinition>,
  required: &CustomResourceDefinition,
  policy: &EstablishPolicy,
  cancel: &CancellationToken,
) -> Result<ApplyOutcome, EstablishError> {
  let name = required
    .metadata
    .name
    .as_deref()
    .filter(|n| !n.is_empty())
    .ok_or(EstablishError::MissingName)?;
  let attempts = policy.attempts.max(1);

  let mut attempt = 1;
  loop {
    match attempt_once(client, name, required, policy, cancel).await {
      Ok(outcome) => {
        info!(crd = name, attempt, "custom resource definition established");
        return Ok(outcome);
      }
      Err(EstablishError::Cancelled) => return Err(EstablishError::Cancelled),
      Err(err) if attempt >= attempts => return Err(err),
      Err(err) => {
        warn!(crd = name, attempt, error = %err, "establishment attempt failed, retrying");
        attempt += 1;
      }
    }
  }
}

async fn attempt_once(
  client: &dyn ObjectClient<CustomResourceDefinition>,
  name: &str,
  required: &CustomResourceDefinition,
  policy: &EstablishPolicy,
  cancel: &CancellationToken,
) -> Result<ApplyOutcome, EstablishError> {
  let mut state = EstablishState::Absent;
  let mut outcome = ApplyOutcome::Unchanged;
  let mut last_observed = String::from("nothing yet");

  match cancellable(cancel, client.get(name)).await? {
    Ok(None) => transition(&mut state, EstablishState::Creating, name),
    Ok(Some(_)) => {
      last_observed = "already exists".into();
      transition(&mut state, EstablishState::PollingEstablished, name);
    }
    Err(err) => {
      last_observed = format!("get failed: {err}");
      transition(&mut state, EstablishState::PollingEstablished, name);
    }
  }

  if state == EstablishState::Creating {
    match cancellable(cancel, client.create(required)).await? {
      Ok(_) => {
        outcome = ApplyOutcome::Created;
        info!(crd = name, "created custom resource definition");
      }
      Err(err) => {
        warn!(crd = name, error = %err, "failed to create custom resource definition");
        last_observed = format!("create failed: {err}");
      }
    }
    transition(&mut state, EstablishState::PollingEstablished, name);
  }

  let deadline = Instant::now() + policy.timeout;
  // `interval` panics on a zero period.
  let mut ticker = tokio::time::interval(policy.interval.max(MIN_INTERVAL));
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(EstablishError::Cancelled),
      _ = tokio::time::sleep_until(deadline) => {
        transition(&mut state, EstablishState::Failed, name);
        return Err(EstablishError::Timeout {
          name: name.to_string(),
          timeout: policy.timeout,
          last_observed,
        });
      }
      _ = ticker.tick() => {}
    }

    match cancellable(cancel, client.get(name)).await? {
      Ok(Some(crd)) => match established_condition(&crd) {
        Some(condition) if condition == "True" => {
          transition(&mut state, EstablishState::Established, name);
          return Ok(outcome);
        }
        Some(condition) => last_observed = format!("{ESTABLISHED}={condition}"),
        None => last_observed = format!("no {ESTABLISHED} condition"),
      },
      Ok(None) => last_observed = "not found".into(),
      Err(err) => last_observed = format!("get failed: {err}"),
    }
    debug!(crd = name, observed = %last_observed, "custom resource definition not established yet");
  }
}

/// Status of the `Established` condition, if the server reported one.
fn established_condition(crd: &CustomResourceDefinition) -> Option<&str> {
  crd
    .status
    .as_ref()?
    .conditions
    .as_ref()?
    .iter()
    .find(|c| c.type_ == ESTABLISHED)
    .map(|c| c.status.as_str())
}

fn transition(state: &mut EstablishState, next: EstablishState, name: &str) {
  let from = *state;
  debug!(crd = name, from = ?from, to = ?next, "establish state");
  *state = next;
}

async fn cancellable<T>(
  cancel: &CancellationToken,
  call: impl std::future::Future<Output = Result<T, ClientError>>,
) -> Result<Result<T, ClientError>, EstablishError> {
  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(EstablishError::Cancelled),
    result = call => Ok(result),
  }
}

/// Handler for CRD manifests: create if absent, then wait for establishment.
pub struct CrdApplier<P> {
  entry: Arc<ClientCacheEntry<P>>,
  policy: EstablishPolicy,
  cancel: CancellationToken,
}

impl<P: ClientProvider> CrdApplier<P> {
  pub fn new(entry: Arc<ClientCacheEntry<P>>, policy: EstablishPolicy, cancel: CancellationToken) -> Self {
    Self { entry, policy, cancel }
  }
}

#[async_trait]
impl<P: ClientProvider> ResourceHandler for CrdApplier<P> {
  type Prepared = CustomResourceDefinition;

  async fn read(
    &self,
    raw: &[u8],
    render: Option<&dyn Render>,
    params: &RenderParams,
  ) -> Result<CustomResourceDefinition, ApplyError> {
    let rendered = render_manifest(raw, render, params)?;
    let mut crd = decode_typed::<CustomResourceDefinition>(&rendered)?;
    crd.metadata.namespace = None;
    Ok(crd)
  }

  async fn handle(&self, crd: CustomResourceDefinition) -> Result<ApplyOutcome, ApplyError> {
    let client = self.entry.provider().typed::<CustomResourceDefinition>("");
    Ok(establish(client.as_ref(), &crd, &self.policy, &self.cancel).await?)
  }

  fn handle_operation(&self) -> Operation {
    Operation::Establish
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{FakeCluster, set_established};
  use std::sync::atomic::{AtomicUsize, Ordering};

  const CRD: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: proxies.config.openshift.io
spec:
  group: config.openshift.io
  names:
    kind: Proxy
    plural: proxies
  scope: Cluster
  versions:
  - name: v1
    served: true
    storage: true
"#;

  fn crd() -> CustomResourceDefinition {
    decode_typed(CRD.as_bytes()).unwrap()
  }

  fn policy() -> EstablishPolicy {
    EstablishPolicy {
      interval: Duration::from_secs(5),
      timeout: Duration::from_secs(60),
      attempts: 3,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn converges_on_the_third_poll() {
    let cluster = FakeCluster::new();
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&polls);
    cluster.on_get("CustomResourceDefinition", "proxies.config.openshift.io", move |object| {
      let poll = counter.fetch_add(1, Ordering::SeqCst) + 1;
      set_established(object, if poll >= 3 { "True" } else { "False" });
    });

    let client = cluster.typed::<CustomResourceDefinition>("");
    let started = Instant::now();
    let outcome = establish(client.as_ref(), &crd(), &policy(), &CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(outcome, ApplyOutcome::Created);
    assert_eq!(polls.load(Ordering::SeqCst), 3);
    // One existence check, then exactly three polls.
    assert_eq!(cluster.gets(), 4);
    assert_eq!(cluster.creates(), 1);
    assert_eq!(started.elapsed(), Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn zero_interval_polls_without_panicking() {
    let cluster = FakeCluster::new();
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&polls);
    cluster.on_get("CustomResourceDefinition", "proxies.config.openshift.io", move |object| {
      let poll = counter.fetch_add(1, Ordering::SeqCst) + 1;
      set_established(object, if poll >= 2 { "True" } else { "False" });
    });
    let policy = EstablishPolicy {
      interval: Duration::ZERO,
      ..policy()
    };

    let client = cluster.typed::<CustomResourceDefinition>("");
    let outcome = establish(client.as_ref(), &crd(), &policy, &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(outcome, ApplyOutcome::Created);
    assert_eq!(polls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn zero_attempts_still_makes_one_attempt() {
    let cluster = FakeCluster::new();
    cluster.fail_create("CustomResourceDefinition", "proxies.config.openshift.io", 500);
    let policy = EstablishPolicy {
      attempts: 0,
      ..policy()
    };

    let client = cluster.typed::<CustomResourceDefinition>("");
    let err = establish(client.as_ref(), &crd(), &policy, &CancellationToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, EstablishError::Timeout { .. }));
    assert_eq!(cluster.create_attempts(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn existing_definition_is_not_recreated() {
    let cluster = FakeCluster::new();
    let client = cluster.typed::<CustomResourceDefinition>("");
    client.create(&crd()).await.unwrap();
    cluster.on_get("CustomResourceDefinition", "proxies.config.openshift.io", |object| {
      set_established(object, "True");
    });

    let outcome = establish(client.as_ref(), &crd(), &policy(), &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(outcome, ApplyOutcome::Unchanged);
    assert_eq!(cluster.creates(), 1);
    assert_eq!(cluster.updates(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn never_established_times_out() {
    let cluster = FakeCluster::new();
    cluster.on_get("CustomResourceDefinition", "proxies.config.openshift.io", |object| {
      set_established(object, "False");
    });

    let client = cluster.typed::<CustomResourceDefinition>("");
    let err = establish(client.as_ref(), &crd(), &policy(), &CancellationToken::new())
      .await
      .unwrap_err();

    match err {
      EstablishError::Timeout {
        name,
        timeout,
        last_observed,
      } => {
        assert_eq!(name, "proxies.config.openshift.io");
        assert_eq!(timeout, Duration::from_secs(60));
        assert_eq!(last_observed, "Established=False");
      }
      other => panic!("expected a timeout, got {other:?}"),
    }
    // One create, then every later attempt sees the object and only polls.
    assert_eq!(cluster.creates(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn create_failure_is_retried_with_a_fresh_cycle() {
    let cluster = FakeCluster::new();
    cluster.fail_create("CustomResourceDefinition", "proxies.config.openshift.io", 500);
    let policy = EstablishPolicy {
      attempts: 2,
      ..policy()
    };

    let client = cluster.typed::<CustomResourceDefinition>("");
    let err = establish(client.as_ref(), &crd(), &policy, &CancellationToken::new())
      .await
      .unwrap_err();

    let EstablishError::Timeout { last_observed, .. } = err else {
      panic!("expected a timeout");
    };
    assert_eq!(last_observed, "not found");
    assert_eq!(cluster.create_attempts(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_stops_polling_promptly() {
    let cluster = FakeCluster::new();
    cluster.on_get("CustomResourceDefinition", "proxies.config.openshift.io", |object| {
      set_established(object, "False");
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_secs(12)).await;
      trigger.cancel();
    });

    let client = cluster.typed::<CustomResourceDefinition>("");
    let started = Instant::now();
    let err = establish(client.as_ref(), &crd(), &policy(), &cancel).await.unwrap_err();

    assert!(matches!(err, EstablishError::Cancelled));
    assert_eq!(started.elapsed(), Duration::from_secs(12));
  }

  #[test]
  fn default_policy_matches_the_installer() {
    let policy = EstablishPolicy::default();
    assert_eq!(policy.interval, Duration::from_secs(5));
    assert_eq!(policy.timeout, Duration::from_secs(600));
    assert_eq!(policy.attempts, 3);
  }
}
