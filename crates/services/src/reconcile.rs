//! Whole-configuration pushes.
//!
//! The pushed document is diffed against the last accepted ledger entry
//! (never against live table state) and applied as delete/add/update
//! operations in a fixed topological order: templates, transactions,
//! segments, campaigns, email provider. A push with no operations leaves
//! the ledger untouched.

use std::collections::BTreeMap;

use rusqlite::Connection;
use segflow_core::types::{
    Campaign, CampaignSpec, ConfigDocument, SegmentSpec, Template, TemplateSpec, Transaction,
    TransactionSpec,
};
use segflow_core::{EngineError, SegflowResult};
use segflow_sandbox::Sandbox;
use segflow_segmentation::triggers;
use segflow_store::{campaigns as campaign_store, catalog, configs as config_store, segments as segment_store};
use tracing::info;

use crate::Services;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    NoChanges,
    Applied { config_id: i64 },
}

struct OpSet<T> {
    deletes: Vec<String>,
    adds: Vec<(String, T)>,
    updates: Vec<(String, T)>,
}

impl<T> OpSet<T> {
    fn count(&self) -> usize {
        self.deletes.len() + self.adds.len() + self.updates.len()
    }
}

impl Services {
    pub fn push_config(&self, document: ConfigDocument) -> SegflowResult<PushOutcome> {
        validate_document(&self.sandbox, &document)?;

        self.db.with_tx(|conn| {
            let previous = match config_store::latest(conn)? {
                Some((_, json)) => serde_json::from_str::<ConfigDocument>(&json)?,
                None => ConfigDocument::default(),
            };

            let templates = diff(&previous.templates, &document.templates);
            let transactions = diff(&previous.transactions, &document.transactions);
            let segments = diff(&previous.segments, &document.segments);
            let campaigns = diff_campaigns(&previous.campaigns, &document.campaigns);
            let provider_changed = previous.email_provider != document.email_provider;

            if let Some((id, _)) = campaigns.updates.first() {
                return Err(EngineError::Unsupported(format!(
                    "campaign {id} cannot be updated; delete and re-add it"
                )));
            }

            let operations = templates.count()
                + transactions.count()
                + segments.count()
                + campaigns.count()
                + usize::from(provider_changed);
            if operations == 0 {
                info!("Configuration push produced no changes");
                return Ok(PushOutcome::NoChanges);
            }

            self.apply_templates(conn, &templates)?;
            self.apply_transactions(conn, &transactions)?;
            self.apply_segments(conn, &segments)?;
            self.apply_campaigns(conn, &campaigns)?;
            if provider_changed {
                match &document.email_provider {
                    Some(provider) => catalog::provider_set(conn, provider)?,
                    None => catalog::provider_clear(conn)?,
                }
            }

            let config_id =
                config_store::append(conn, &serde_json::to_string(&document)?, self.clock.now())?;
            info!(config_id, operations, "Configuration applied");
            Ok(PushOutcome::Applied { config_id })
        })
    }

    fn apply_templates(&self, conn: &Connection, ops: &OpSet<TemplateSpec>) -> SegflowResult<()> {
        for id in &ops.deletes {
            catalog::template_delete(conn, id)?;
        }
        for (id, spec) in &ops.adds {
            catalog::template_insert(conn, &to_template(id, spec))?;
        }
        for (id, spec) in &ops.updates {
            catalog::template_update(conn, &to_template(id, spec))?;
        }
        Ok(())
    }

    fn apply_transactions(
        &self,
        conn: &Connection,
        ops: &OpSet<TransactionSpec>,
    ) -> SegflowResult<()> {
        for id in &ops.deletes {
            catalog::transaction_delete(conn, id)?;
        }
        for (id, spec) in &ops.adds {
            catalog::transaction_insert(conn, &to_transaction(id, spec))?;
        }
        for (id, spec) in &ops.updates {
            catalog::transaction_update(conn, &to_transaction(id, spec))?;
        }
        Ok(())
    }

    fn apply_segments(&self, conn: &Connection, ops: &OpSet<SegmentSpec>) -> SegflowResult<()> {
        for id in &ops.deletes {
            // Campaigns that referenced this segment are themselves deleted
            // later in this push; validation guarantees no survivor still
            // points at it.
            segment_store::delete(conn, id)?;
        }
        for (id, spec) in &ops.adds {
            self.apply_segment(conn, id, &spec.evaluator, true)?;
        }
        for (id, spec) in &ops.updates {
            self.apply_segment(conn, id, &spec.evaluator, false)?;
        }
        Ok(())
    }

    fn apply_campaigns(&self, conn: &Connection, ops: &OpSet<CampaignSpec>) -> SegflowResult<()> {
        for id in &ops.deletes {
            self.delete_campaign_internal(conn, id)?;
        }
        for (id, spec) in &ops.adds {
            let campaign = Campaign {
                id: id.clone(),
                flow: spec.flow.clone(),
                behavior: spec.behavior,
                segments: spec.segments.clone(),
                exclude_segments: spec.exclude_segments.clone(),
                created_at: self.clock.now(),
            };
            campaign_store::insert(conn, &campaign)?;
            self.resolver.enroll_campaign(conn, &campaign)?;
        }
        // Updates were rejected up front.
        Ok(())
    }
}

fn to_template(id: &str, spec: &TemplateSpec) -> Template {
    Template {
        id: id.to_string(),
        subject: spec.subject.clone(),
        html: spec.html.clone(),
        preamble: spec.preamble.clone(),
    }
}

fn to_transaction(id: &str, spec: &TransactionSpec) -> Transaction {
    Transaction {
        id: id.to_string(),
        event: spec.event.clone(),
        subject: spec.subject.clone(),
        html: spec.html.clone(),
        preamble: spec.preamble.clone(),
    }
}

fn diff<T: PartialEq + Clone>(
    old: &BTreeMap<String, T>,
    new: &BTreeMap<String, T>,
) -> OpSet<T> {
    let mut ops = OpSet {
        deletes: Vec::new(),
        adds: Vec::new(),
        updates: Vec::new(),
    };
    for key in old.keys() {
        if !new.contains_key(key) {
            ops.deletes.push(key.clone());
        }
    }
    for (key, value) in new {
        match old.get(key) {
            None => ops.adds.push((key.clone(), value.clone())),
            Some(existing) if existing != value => ops.updates.push((key.clone(), value.clone())),
            Some(_) => {}
        }
    }
    ops
}

/// Campaign payloads compare with their segment lists as sorted sets.
fn diff_campaigns(
    old: &BTreeMap<String, CampaignSpec>,
    new: &BTreeMap<String, CampaignSpec>,
) -> OpSet<CampaignSpec> {
    let normalize = |specs: &BTreeMap<String, CampaignSpec>| -> BTreeMap<String, CampaignSpec> {
        specs
            .iter()
            .map(|(id, spec)| {
                let mut spec = spec.clone();
                spec.segments.sort();
                spec.exclude_segments.sort();
                (id.clone(), spec)
            })
            .collect()
    };
    let mut ops = diff(&normalize(old), &normalize(new));
    // Adds carry the original (unsorted) payload.
    for (id, spec) in &mut ops.adds {
        if let Some(original) = new.get(id) {
            *spec = original.clone();
        }
    }
    ops
}

fn validate_document(sandbox: &Sandbox, document: &ConfigDocument) -> SegflowResult<()> {
    for (id, spec) in &document.segments {
        if triggers::is_single_statement(&spec.evaluator) == Some(false) {
            return Err(EngineError::Validation(format!(
                "segment {id} evaluator must be a single SQL statement"
            )));
        }
    }
    for (id, spec) in &document.campaigns {
        if spec.segments.is_empty() {
            return Err(EngineError::Validation(format!(
                "campaign {id} must include at least one segment"
            )));
        }
        for segment_id in spec.segments.iter().chain(spec.exclude_segments.iter()) {
            if !document.segments.contains_key(segment_id) {
                return Err(EngineError::Validation(format!(
                    "campaign {id} references unknown segment {segment_id}"
                )));
            }
        }
        sandbox
            .compile_check(&spec.flow)
            .map_err(|e| EngineError::Validation(format!("campaign {id} flow: {e}")))?;
    }
    Ok(())
}
