//! User, event, segment, campaign, template and provider services.

use std::sync::Arc;

use rusqlite::Connection;
use segflow_channels::EmailSender;
use segflow_core::clock::Clock;
use segflow_core::types::{
    Attributes, Campaign, CampaignBehavior, EmailProvider, Event, Segment, Template, User,
};
use segflow_core::{EngineError, SegflowResult};
use segflow_sandbox::Sandbox;
use segflow_segmentation::{triggers, MembershipResolver, SegmentEvaluator};
use segflow_store::{
    campaigns as campaign_store, catalog, events as event_store, executions as execution_store,
    segments as segment_store, users as user_store, Database,
};
use tracing::info;

use crate::dispatch;

pub struct Services {
    pub(crate) db: Arc<Database>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sender: Arc<dyn EmailSender>,
    pub(crate) sandbox: Sandbox,
    pub(crate) segments: SegmentEvaluator,
    pub(crate) resolver: MembershipResolver,
}

impl Services {
    pub fn new(db: Arc<Database>, sender: Arc<dyn EmailSender>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            sender,
            sandbox: Sandbox::new(),
            segments: SegmentEvaluator::new(),
            resolver: MembershipResolver::new(clock.clone()),
            clock,
        }
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    // ─── Users ─────────────────────────────────────────────────────────────

    pub fn create_user(&self, id: &str, attributes: Attributes) -> SegflowResult<User> {
        require_email(&attributes)?;
        self.db.with_tx(|conn| {
            if user_store::get(conn, id)?.is_some() {
                return Err(EngineError::Validation(format!("user {id} already exists")));
            }
            let now = self.clock.now();
            let user = User {
                id: id.to_string(),
                attributes: attributes.clone(),
                created_at: now,
                updated_at: now,
            };
            user_store::insert(conn, &user)?;
            self.resolver.refresh_user(conn, &self.segments, id)?;
            info!(user_id = id, "User created");
            Ok(user)
        })
    }

    /// Shallow-merge the given attributes over the existing document.
    pub fn update_user(&self, id: &str, partial: Attributes) -> SegflowResult<User> {
        self.db.with_tx(|conn| {
            let mut user = user_store::require(conn, id)?;
            for (key, value) in partial.clone() {
                user.attributes.insert(key, value);
            }
            require_email(&user.attributes)?;
            let now = self.clock.now();
            user_store::update_attributes(conn, id, &user.attributes, now)?;
            user.updated_at = now;
            self.resolver.refresh_user(conn, &self.segments, id)?;
            Ok(user)
        })
    }

    pub fn get_user(&self, id: &str) -> SegflowResult<User> {
        self.db.with_tx(|conn| user_store::require(conn, id))
    }

    pub fn delete_user(&self, id: &str) -> SegflowResult<()> {
        self.db.with_tx(|conn| {
            user_store::require(conn, id)?;
            user_store::delete(conn, id)?;
            info!(user_id = id, "User deleted");
            Ok(())
        })
    }

    // ─── Events ────────────────────────────────────────────────────────────

    /// Insert the event and reevaluate memberships in one transaction;
    /// transactional email goes out best-effort after the commit.
    pub fn emit_event(
        &self,
        user_id: &str,
        name: &str,
        attributes: Attributes,
    ) -> SegflowResult<Event> {
        let (event, user_attributes, transaction, provider) = self.db.with_tx(|conn| {
            user_store::require(conn, user_id)?;
            let now = self.clock.now();
            let event = event_store::insert(conn, user_id, name, &attributes, now)?;

            self.segments
                .evaluate_for_user_on_event(conn, user_id, name)?;
            self.resolver.reevaluate_for_user(conn, user_id)?;

            let user = user_store::require(conn, user_id)?;
            let transaction = catalog::transaction_for_event(conn, name)?;
            let provider = catalog::provider_get(conn)?;
            Ok((event, user.attributes, transaction, provider))
        })?;

        metrics::counter!("events.ingested").increment(1);

        if let Some(transaction) = transaction {
            dispatch::dispatch_transactional(
                &self.sandbox,
                self.sender.as_ref(),
                provider.as_ref(),
                &transaction,
                &user_attributes,
                &event,
            );
        }
        Ok(event)
    }

    pub fn list_user_events(&self, user_id: &str) -> SegflowResult<Vec<Event>> {
        self.db.with_tx(|conn| {
            user_store::require(conn, user_id)?;
            event_store::list_for_user(conn, user_id)
        })
    }

    // ─── Segments ──────────────────────────────────────────────────────────

    pub fn create_segment(&self, id: &str, evaluator: &str) -> SegflowResult<Segment> {
        validate_segment_sql(evaluator)?;
        self.db.with_tx(|conn| {
            if segment_store::get(conn, id)?.is_some() {
                return Err(EngineError::Validation(format!(
                    "segment {id} already exists"
                )));
            }
            self.apply_segment(conn, id, evaluator, true)
        })
    }

    pub fn update_segment(&self, id: &str, evaluator: &str) -> SegflowResult<Segment> {
        validate_segment_sql(evaluator)?;
        self.db.with_tx(|conn| {
            segment_store::require(conn, id)?;
            self.apply_segment(conn, id, evaluator, false)
        })
    }

    /// Write a segment and bring memberships and campaigns in line with it.
    /// Shared between the segment services and the config reconciler.
    pub(crate) fn apply_segment(
        &self,
        conn: &Connection,
        id: &str,
        evaluator: &str,
        new: bool,
    ) -> SegflowResult<Segment> {
        let now = self.clock.now();
        let segment = if new {
            let segment = Segment {
                id: id.to_string(),
                evaluator: evaluator.to_string(),
                created_at: now,
                updated_at: now,
            };
            segment_store::insert(conn, &segment)?;
            segment
        } else {
            segment_store::update_evaluator(conn, id, evaluator, now)?;
            segment_store::require(conn, id)?
        };

        segment_store::set_triggers(conn, id, &triggers::extract_event_triggers(evaluator))?;
        let changes = self.segments.evaluate_global(conn, id)?;
        self.resolver
            .reevaluate_for_segment_change(conn, id, &changes)?;
        info!(segment_id = id, new, "Segment applied");
        Ok(segment)
    }

    pub fn delete_segment(&self, id: &str) -> SegflowResult<()> {
        self.db.with_tx(|conn| {
            segment_store::require(conn, id)?;
            let referencing = campaign_store::referencing_segment(conn, id)?;
            if !referencing.is_empty() {
                return Err(EngineError::Constraint(format!(
                    "segment {id} is referenced by campaigns: {}",
                    referencing.join(", ")
                )));
            }
            segment_store::delete(conn, id)?;
            info!(segment_id = id, "Segment deleted");
            Ok(())
        })
    }

    pub fn get_segment(&self, id: &str) -> SegflowResult<Segment> {
        self.db.with_tx(|conn| segment_store::require(conn, id))
    }

    pub fn list_segments(&self) -> SegflowResult<Vec<Segment>> {
        self.db.with_tx(segment_store::list)
    }

    pub fn list_segment_users(&self, id: &str) -> SegflowResult<Vec<String>> {
        self.db.with_tx(|conn| {
            segment_store::require(conn, id)?;
            Ok(segment_store::members(conn, id)?.into_iter().collect())
        })
    }

    pub fn list_user_segments(&self, user_id: &str) -> SegflowResult<Vec<String>> {
        self.db.with_tx(|conn| {
            user_store::require(conn, user_id)?;
            segment_store::memberships_for_user(conn, user_id)
        })
    }

    // ─── Campaigns ─────────────────────────────────────────────────────────

    pub fn create_campaign(
        &self,
        id: &str,
        flow: &str,
        segments: Vec<String>,
        exclude_segments: Vec<String>,
        behavior: CampaignBehavior,
    ) -> SegflowResult<Campaign> {
        if segments.is_empty() {
            return Err(EngineError::Validation(
                "campaign must include at least one segment".to_string(),
            ));
        }
        self.sandbox.compile_check(flow)?;
        self.db.with_tx(|conn| {
            if campaign_store::get(conn, id)?.is_some() {
                return Err(EngineError::Validation(format!(
                    "campaign {id} already exists"
                )));
            }
            for segment_id in segments.iter().chain(exclude_segments.iter()) {
                if segment_store::get(conn, segment_id)?.is_none() {
                    return Err(EngineError::Validation(format!(
                        "unknown segment {segment_id}"
                    )));
                }
            }
            let campaign = Campaign {
                id: id.to_string(),
                flow: flow.to_string(),
                behavior,
                segments: segments.clone(),
                exclude_segments: exclude_segments.clone(),
                created_at: self.clock.now(),
            };
            campaign_store::insert(conn, &campaign)?;
            self.resolver.enroll_campaign(conn, &campaign)?;
            info!(campaign_id = id, "Campaign created");
            Ok(campaign)
        })
    }

    pub fn delete_campaign(&self, id: &str) -> SegflowResult<()> {
        self.db.with_tx(|conn| {
            campaign_store::require(conn, id)?;
            self.delete_campaign_internal(conn, id)
        })
    }

    pub(crate) fn delete_campaign_internal(
        &self,
        conn: &Connection,
        id: &str,
    ) -> SegflowResult<()> {
        let now = self.clock.now();
        execution_store::terminate_all_for_campaign(conn, id, "Campaign deleted", now)?;
        execution_store::delete_for_campaign(conn, id)?;
        campaign_store::delete(conn, id)?;
        info!(campaign_id = id, "Campaign deleted");
        Ok(())
    }

    pub fn get_campaign(&self, id: &str) -> SegflowResult<Campaign> {
        self.db.with_tx(|conn| campaign_store::require(conn, id))
    }

    pub fn list_campaigns(&self) -> SegflowResult<Vec<Campaign>> {
        self.db.with_tx(campaign_store::list)
    }

    // ─── Templates ─────────────────────────────────────────────────────────

    pub fn create_template(
        &self,
        id: &str,
        subject: &str,
        html: &str,
        preamble: &str,
    ) -> SegflowResult<Template> {
        self.db.with_tx(|conn| {
            if catalog::template_get(conn, id)?.is_some() {
                return Err(EngineError::Validation(format!(
                    "template {id} already exists"
                )));
            }
            let template = Template {
                id: id.to_string(),
                subject: subject.to_string(),
                html: html.to_string(),
                preamble: preamble.to_string(),
            };
            catalog::template_insert(conn, &template)?;
            Ok(template)
        })
    }

    pub fn update_template(
        &self,
        id: &str,
        subject: &str,
        html: &str,
        preamble: &str,
    ) -> SegflowResult<Template> {
        self.db.with_tx(|conn| {
            catalog::template_require(conn, id)?;
            let template = Template {
                id: id.to_string(),
                subject: subject.to_string(),
                html: html.to_string(),
                preamble: preamble.to_string(),
            };
            catalog::template_update(conn, &template)?;
            Ok(template)
        })
    }

    pub fn delete_template(&self, id: &str) -> SegflowResult<()> {
        self.db.with_tx(|conn| {
            catalog::template_require(conn, id)?;
            catalog::template_delete(conn, id)?;
            Ok(())
        })
    }

    // ─── Email provider ────────────────────────────────────────────────────

    pub fn set_email_provider(&self, provider: EmailProvider) -> SegflowResult<()> {
        self.db.with_tx(|conn| {
            catalog::provider_set(conn, &provider)?;
            info!(from = %provider.from_address, "Email provider configured");
            Ok(())
        })
    }
}

fn require_email(attributes: &Attributes) -> SegflowResult<()> {
    match attributes.get("email") {
        Some(serde_json::Value::String(_)) => Ok(()),
        _ => Err(EngineError::Validation(
            "attributes must include a string `email`".to_string(),
        )),
    }
}

fn validate_segment_sql(evaluator: &str) -> SegflowResult<()> {
    if triggers::is_single_statement(evaluator) == Some(false) {
        return Err(EngineError::Validation(
            "segment evaluator must be a single SQL statement".to_string(),
        ));
    }
    Ok(())
}
