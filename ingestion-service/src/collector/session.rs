//! Per-endpoint session runner shared by reads and writes.
//!
//! A plan is a list of steps applied to every unit behind one endpoint, on a
//! single session. The session is always disconnected once it was opened,
//! including when the endpoint deadline runs out; the deadline is checked
//! between steps so a device exchange is never cut off halfway.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::{stream, StreamExt};
use ledger_client::domain::Unit;
use serde::Serialize;
use tokio::time::Instant;

use super::{ParameterSpec, Roster, WriteTarget};
use crate::s7::{decode, encode, DeviceAddress, DeviceConnector, DeviceSession, ProtocolError, Scalar};

pub(crate) const SESSION_TIMED_OUT: &str = "device session timed out";
pub(crate) const SESSION_TASK_FAILED: &str = "device session task failed";

/// Result of one step for one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceOutcome {
    pub unit: Unit,
    pub parameter: String,
    pub success: bool,
    pub message: String,
    pub value: Option<Scalar>,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Read(ParameterSpec),
    Write { target: WriteTarget, value: Scalar },
}

impl Action {
    fn ok_message(&self) -> &'static str {
        match self {
            Self::Read(_) => "read ok",
            Self::Write { .. } => "write ok",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Write { .. } => "write",
        }
    }

    fn count(&self, ok: bool, n: u64) {
        match (self, ok) {
            (Self::Read(_), true) => metrics::counter!("device_reads_ok_total").increment(n),
            (Self::Read(_), false) => metrics::counter!("device_reads_failed_total").increment(n),
            (Self::Write { .. }, true) => metrics::counter!("device_writes_ok_total").increment(n),
            (Self::Write { .. }, false) => metrics::counter!("device_writes_failed_total").increment(n),
        }
    }

    async fn perform<S: DeviceSession>(&self, session: &mut S) -> Result<Scalar, ProtocolError> {
        match self {
            Self::Read(spec) => {
                let bytes = session.read(spec.block, spec.offset, spec.length).await?;
                decode(&bytes, spec.value_type)
            }
            Self::Write { target, value } => {
                let bytes = encode(*value, target.value_type)?;
                session.write(target.block, target.offset, &bytes).await?;
                Ok(*value)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    pub parameter: String,
    pub action: Action,
}

pub(crate) type Plan = Arc<Vec<Step>>;

/// Runs `plan` against every endpoint in `roster`, at most `workers` at once.
pub(crate) async fn fan_out<C>(
    connector: Arc<C>,
    roster: &Roster,
    plan: Plan,
    workers: usize,
    deadline: Duration,
) -> Vec<DeviceOutcome>
where
    C: DeviceConnector + 'static,
{
    let sessions = group_by_endpoint(roster).into_iter().map(|(address, units)| {
        let connector = connector.clone();
        let plan = plan.clone();
        async move { run_session(connector, address, units, plan, deadline).await }
    });

    stream::iter(sessions)
        .buffer_unordered(workers.max(1))
        .flat_map(stream::iter)
        .collect()
        .await
}

pub(crate) fn group_by_endpoint(roster: &Roster) -> BTreeMap<DeviceAddress, Vec<Unit>> {
    let mut groups: BTreeMap<DeviceAddress, Vec<Unit>> = BTreeMap::new();
    for entry in &roster.entries {
        groups.entry(entry.address.clone()).or_default().push(entry.unit.clone());
    }
    groups
}

fn uniform_failure(address: &DeviceAddress, units: &[Unit], plan: &[Step], reason: &str) -> Vec<DeviceOutcome> {
    for step in plan {
        step.action.count(false, units.len() as u64);
    }
    units
        .iter()
        .flat_map(|unit| {
            plan.iter().map(move |step| DeviceOutcome {
                unit: unit.clone(),
                parameter: step.parameter.clone(),
                success: false,
                message: reason.to_string(),
                value: None,
                address: address.ip.clone(),
            })
        })
        .collect()
}

/// Runs one endpoint's session on its own task. A panic fails every step of
/// the endpoint.
async fn run_session<C>(
    connector: Arc<C>,
    address: DeviceAddress,
    units: Vec<Unit>,
    plan: Plan,
    deadline: Duration,
) -> Vec<DeviceOutcome>
where
    C: DeviceConnector + 'static,
{
    let task = tokio::spawn(run_endpoint(
        connector,
        address.clone(),
        units.clone(),
        plan.clone(),
        deadline,
    ));

    match task.await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            tracing::error!(device = %address, error = %e, "device session task failed");
            uniform_failure(&address, &units, &plan, SESSION_TASK_FAILED)
        }
    }
}

/// Connect, apply every step for every unit, disconnect. Overrunning
/// `deadline` turns the whole endpoint into a uniform failure.
async fn run_endpoint<C>(
    connector: Arc<C>,
    address: DeviceAddress,
    units: Vec<Unit>,
    plan: Plan,
    deadline: Duration,
) -> Vec<DeviceOutcome>
where
    C: DeviceConnector,
{
    let started = Instant::now();
    let mut session = match tokio::time::timeout(deadline, connector.connect(&address)).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            tracing::warn!(device = %address, error = %e, "device connect failed");
            return uniform_failure(&address, &units, &plan, &e.to_string());
        }
        Err(_elapsed) => {
            tracing::warn!(device = %address, deadline_ms = deadline.as_millis() as u64, "device connect exceeded session deadline");
            return uniform_failure(&address, &units, &plan, SESSION_TIMED_OUT);
        }
    };

    let mut outcomes = Vec::with_capacity(units.len() * plan.len());
    let mut overran = false;
    'units: for unit in &units {
        for step in plan.iter() {
            if started.elapsed() >= deadline {
                overran = true;
                break 'units;
            }
            let result = step.action.perform(&mut session).await;
            step.action.count(result.is_ok(), 1);
            let (success, message, value) = match result {
                Ok(value) => (true, step.action.ok_message().to_string(), Some(value)),
                Err(e) => {
                    tracing::warn!(
                        device = %address,
                        unit = %unit,
                        parameter = %step.parameter,
                        error = %e,
                        "parameter {} failed",
                        step.action.verb()
                    );
                    (false, e.to_string(), None)
                }
            };
            outcomes.push(DeviceOutcome {
                unit: unit.clone(),
                parameter: step.parameter.clone(),
                success,
                message,
                value,
                address: address.ip.clone(),
            });
        }
    }
    overran |= started.elapsed() > deadline;

    session.disconnect().await;

    if overran {
        tracing::warn!(
            device = %address,
            deadline_ms = deadline.as_millis() as u64,
            completed = outcomes.len(),
            "device session exceeded deadline"
        );
        return uniform_failure(&address, &units, &plan, SESSION_TIMED_OUT);
    }
    outcomes
}
