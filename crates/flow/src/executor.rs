//! Periodic tick worker driving campaign flows forward.
//!
//! Each tick opens one transaction, claims every due execution (flipping it
//! to `running` so an overlapping tick skips it), and advances each claimed
//! row by exactly one yield. A failure in one row fails that execution and
//! leaves the others alone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use segflow_channels::{EmailMessage, EmailSender};
use segflow_core::clock::Clock;
use segflow_core::command::Command;
use segflow_core::types::{Attributes, Campaign, CampaignBehavior, ExecutionStatus};
use segflow_core::{EngineError, SegflowResult};
use segflow_sandbox::Sandbox;
use segflow_segmentation::membership::DYNAMIC_EXIT_REASON;
use segflow_segmentation::{MembershipResolver, SegmentEvaluator};
use segflow_store::executions::ClaimedExecution;
use segflow_store::{campaigns, catalog, executions, users, Database};
use tracing::{debug, error, warn};

pub struct FlowExecutor {
    db: Arc<Database>,
    sandbox: Sandbox,
    segments: SegmentEvaluator,
    resolver: MembershipResolver,
    sender: Arc<dyn EmailSender>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    pub claimed: usize,
    pub stepped: usize,
    pub completed: usize,
    pub terminated: usize,
    pub failed: usize,
}

enum StepAdvance {
    Stepped,
    Completed,
    Terminated,
}

impl FlowExecutor {
    pub fn new(db: Arc<Database>, sender: Arc<dyn EmailSender>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            sandbox: Sandbox::new(),
            segments: SegmentEvaluator::new(),
            resolver: MembershipResolver::new(clock.clone()),
            sender,
            clock,
        }
    }

    /// Run ticks forever on the given period. Claimed rows flip to
    /// `running`, so a tick that outlives its period self-throttles the
    /// next one.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let executor = self.clone();
            match tokio::task::spawn_blocking(move || executor.tick()).await {
                Ok(Ok(stats)) => {
                    if stats.claimed > 0 {
                        debug!(
                            claimed = stats.claimed,
                            stepped = stats.stepped,
                            completed = stats.completed,
                            terminated = stats.terminated,
                            failed = stats.failed,
                            "Tick finished"
                        );
                    }
                }
                Ok(Err(e)) => error!(error = %e, "Tick failed"),
                Err(e) => error!(error = %e, "Tick task panicked"),
            }
        }
    }

    /// One tick: claim all due executions and advance each one step.
    pub fn tick(&self) -> SegflowResult<TickStats> {
        self.db.with_tx(|conn| {
            let now = self.clock.now();
            let claimed = executions::claim_due(conn, now, None)?;
            let mut stats = TickStats {
                claimed: claimed.len(),
                ..TickStats::default()
            };

            for row in &claimed {
                match self.advance(conn, row) {
                    Ok(StepAdvance::Stepped) => {
                        stats.stepped += 1;
                        metrics::counter!("flow.steps_advanced").increment(1);
                    }
                    Ok(StepAdvance::Completed) => stats.completed += 1,
                    Ok(StepAdvance::Terminated) => stats.terminated += 1,
                    Err(err) => {
                        warn!(
                            user_id = %row.user_id,
                            campaign_id = %row.campaign_id,
                            error = %err,
                            "Flow step failed"
                        );
                        executions::fail(
                            conn,
                            &row.user_id,
                            &row.campaign_id,
                            &err.to_string(),
                            self.clock.now(),
                        )?;
                        stats.failed += 1;
                    }
                }
            }
            Ok(stats)
        })
    }

    fn advance(&self, conn: &Connection, row: &ClaimedExecution) -> SegflowResult<StepAdvance> {
        let campaign = campaigns::require(conn, &row.campaign_id)?;
        let user = users::require(conn, &row.user_id)?;
        let now = self.clock.now();

        let (step_index, attr_states) = match row.prior_status {
            ExecutionStatus::Pending => (
                0usize,
                vec![serde_json::Value::Object(user.attributes.clone())],
            ),
            ExecutionStatus::Sleeping => {
                let history = executions::history_for(conn, &row.user_id, &row.campaign_id)?;
                let mut states: Vec<serde_json::Value> = history
                    .into_iter()
                    .map(|step| serde_json::Value::Object(step.attributes))
                    .collect();
                let step_index = states.len();
                states.push(serde_json::Value::Object(user.attributes.clone()));
                (step_index, states)
            }
            other => {
                return Err(EngineError::Internal(anyhow!(
                    "claimed execution in unexpected status {}",
                    other.as_str()
                )))
            }
        };

        // Leavers exit before any further work on an already-started flow.
        if campaign.behavior == CampaignBehavior::Dynamic
            && step_index > 0
            && !self.resolver.matches(conn, &row.user_id, &campaign)?
        {
            executions::terminate(conn, &row.user_id, &row.campaign_id, DYNAMIC_EXIT_REASON, now)?;
            return Ok(StepAdvance::Terminated);
        }

        // Record what this step will observe before running it.
        executions::append_history(
            conn,
            &row.user_id,
            &row.campaign_id,
            step_index as i64,
            &user.attributes,
            now,
        )?;

        let outcome = self
            .sandbox
            .step_flow(&campaign.flow, &attr_states, step_index)?;

        let final_attrs = outcome
            .attributes
            .as_object()
            .ok_or_else(|| {
                EngineError::Sandbox("flow replaced the attribute document with a non-object".to_string())
            })?
            .clone();

        if final_attrs != user.attributes {
            users::update_attributes(conn, &user.id, &final_attrs, now)?;
            // Can evict this very execution (dynamic); the terminal row
            // then absorbs the writes below.
            self.resolver.refresh_user(conn, &self.segments, &user.id)?;
        }

        match (outcome.done, outcome.command) {
            (true, _) => {
                executions::complete(conn, &row.user_id, &row.campaign_id, now)?;
                Ok(StepAdvance::Completed)
            }
            (false, None) => Err(EngineError::Sandbox(
                "flow yielded no command".to_string(),
            )),
            (false, Some(command)) => {
                if campaign.behavior == CampaignBehavior::Dynamic
                    && !self.resolver.matches(conn, &row.user_id, &campaign)?
                {
                    executions::terminate(
                        conn,
                        &row.user_id,
                        &row.campaign_id,
                        DYNAMIC_EXIT_REASON,
                        now,
                    )?;
                    return Ok(StepAdvance::Terminated);
                }
                self.enact(conn, &row.user_id, &final_attrs, &campaign, command, now)?;
                Ok(StepAdvance::Stepped)
            }
        }
    }

    fn enact(
        &self,
        conn: &Connection,
        user_id: &str,
        attrs: &Attributes,
        campaign: &Campaign,
        command: Command,
        now: DateTime<Utc>,
    ) -> SegflowResult<()> {
        match command {
            Command::Wait { duration } => {
                let until = now + duration.as_duration();
                executions::sleep_until(conn, user_id, &campaign.id, until, now)?;
            }
            Command::SendEmail { template_id } => {
                let template = catalog::template_require(conn, &template_id)?;
                let provider = catalog::provider_get(conn)?.ok_or_else(|| {
                    EngineError::Transport("no email provider configured".to_string())
                })?;

                let user_value = serde_json::Value::Object(attrs.clone());
                let subject =
                    self.sandbox
                        .render(&template.subject, "", &[("user", &user_value)])?;
                let html = self.sandbox.render(
                    &template.html,
                    &template.preamble,
                    &[("user", &user_value)],
                )?;
                let to = attrs
                    .get("email")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        EngineError::Validation(format!("user {user_id} has no email attribute"))
                    })?
                    .to_string();

                self.sender.send(
                    &provider,
                    &EmailMessage { to, subject, html },
                )?;

                // Wake immediately so the next tick advances to the
                // following yield.
                executions::sleep_until(conn, user_id, &campaign.id, now, now)?;
            }
            Command::SendSms { .. } => {
                return Err(EngineError::Unsupported(
                    "SMS delivery is not implemented".to_string(),
                ));
            }
        }
        Ok(())
    }
}
