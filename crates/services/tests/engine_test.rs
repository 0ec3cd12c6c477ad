//! End-to-end scenarios over the ingress services, the reconciler and the
//! flow executor, sharing one in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use segflow_channels::{CaptureSender, EmailSender};
use segflow_core::clock::{Clock, ManualClock};
use segflow_core::types::{
    Attributes, CampaignBehavior, CampaignSpec, ConfigDocument, EmailProvider,
    EmailProviderConfig, ExecutionStatus, SegmentSpec, TemplateSpec, TransactionSpec,
};
use segflow_core::EngineError;
use segflow_flow::FlowExecutor;
use segflow_services::{PushOutcome, Services};
use segflow_store::{campaigns, catalog, configs, executions, segments, Database};

struct Harness {
    db: Arc<Database>,
    clock: Arc<ManualClock>,
    sender: Arc<CaptureSender>,
    services: Services,
    executor: FlowExecutor,
}

fn start_instant() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap()
}

fn harness() -> Harness {
    let db = Arc::new(Database::open_memory().unwrap());
    let clock = Arc::new(ManualClock::new(start_instant()));
    let sender = Arc::new(CaptureSender::new());
    let services = Services::new(
        db.clone(),
        sender.clone() as Arc<dyn EmailSender>,
        clock.clone(),
    );
    let executor = FlowExecutor::new(
        db.clone(),
        sender.clone() as Arc<dyn EmailSender>,
        clock.clone(),
    );
    Harness {
        db,
        clock,
        sender,
        services,
        executor,
    }
}

fn attrs(value: serde_json::Value) -> Attributes {
    value.as_object().unwrap().clone()
}

fn provider() -> EmailProvider {
    EmailProvider {
        config: EmailProviderConfig::Postmark {
            api_key: "pm-test".to_string(),
        },
        from_address: "noreply@x".to_string(),
    }
}

const ACTIVE_SEGMENT: &str =
    "SELECT id FROM users WHERE JSON_EXTRACT(attributes, '$.active') = true";

#[test]
fn static_campaigns_keep_members_who_stop_matching() {
    let h = harness();
    h.services.set_email_provider(provider()).unwrap();
    h.services
        .create_template("welcome", "hi", "body", "")
        .unwrap();
    h.services.create_segment("active", ACTIVE_SEGMENT).unwrap();
    h.services
        .create_campaign(
            "c",
            r#"send_email("welcome");"#,
            vec!["active".to_string()],
            vec![],
            CampaignBehavior::Static,
        )
        .unwrap();

    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "a@x", "active": true})))
        .unwrap();
    assert_eq!(h.services.list_segment_users("active").unwrap(), vec!["u1"]);

    // Run the flow to completion.
    h.executor.tick().unwrap();
    h.executor.tick().unwrap();
    h.db.with_tx(|conn| {
        assert_eq!(
            executions::get(conn, "u1", "c")?.unwrap().status,
            ExecutionStatus::Completed
        );
        Ok(())
    })
    .unwrap();

    // The user stops matching: segment membership goes, campaign membership
    // stays.
    h.services
        .update_user("u1", attrs(serde_json::json!({"active": false})))
        .unwrap();
    assert!(h.services.list_segment_users("active").unwrap().is_empty());
    h.db.with_tx(|conn| {
        assert!(campaigns::is_member(conn, "u1", "c")?);
        Ok(())
    })
    .unwrap();
}

#[test]
fn dynamic_campaigns_evict_mid_flow_without_a_second_email() {
    let h = harness();
    h.services.set_email_provider(provider()).unwrap();
    h.services
        .create_template("welcome", "hi", "body", "")
        .unwrap();
    h.services.create_segment("active", ACTIVE_SEGMENT).unwrap();
    h.services
        .create_campaign(
            "c",
            r#"send_email("welcome"); wait(#{seconds: 60}); send_email("welcome");"#,
            vec!["active".to_string()],
            vec![],
            CampaignBehavior::Dynamic,
        )
        .unwrap();
    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "a@x", "active": true})))
        .unwrap();

    // First tick sends the email; second reaches the wait.
    h.executor.tick().unwrap();
    h.executor.tick().unwrap();
    assert_eq!(h.sender.count(), 1);

    let t0 = h.clock.now();
    h.db.with_tx(|conn| {
        let execution = executions::get(conn, "u1", "c")?.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Sleeping);
        assert_eq!(execution.sleep_until, t0 + Duration::seconds(60));
        Ok(())
    })
    .unwrap();

    // The user stops matching before the wait elapses.
    h.services
        .update_user("u1", attrs(serde_json::json!({"active": false})))
        .unwrap();

    h.db.with_tx(|conn| {
        assert!(!campaigns::is_member(conn, "u1", "c")?);
        let execution = executions::get(conn, "u1", "c")?.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Terminated);
        assert!(execution.error.unwrap().contains("no longer matches"));
        Ok(())
    })
    .unwrap();

    // Past the deadline nothing more happens.
    h.clock.advance(Duration::seconds(120));
    let stats = h.executor.tick().unwrap();
    assert_eq!(stats.claimed, 0);
    assert_eq!(h.sender.count(), 1);
}

#[test]
fn event_triggered_transactional_email() {
    let h = harness();
    h.services.set_email_provider(provider()).unwrap();
    h.db.with_tx(|conn| {
        catalog::transaction_insert(
            conn,
            &segflow_core::types::Transaction {
                id: "purchase".to_string(),
                event: "purchase".to_string(),
                subject: "Order <%= event.id %>".to_string(),
                html: "<%= user.name %>: $<%= event.amount %>".to_string(),
                preamble: String::new(),
            },
        )
    })
    .unwrap();

    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "e@x", "name": "N"})))
        .unwrap();
    h.services
        .emit_event(
            "u1",
            "purchase",
            attrs(serde_json::json!({"id": "o1", "amount": 42})),
        )
        .unwrap();

    assert_eq!(h.sender.count(), 1);
    let email = &h.sender.sent()[0];
    assert_eq!(email.to, "e@x");
    assert_eq!(email.subject, "Order o1");
    assert!(email.html.contains("N: $42"));
}

#[test]
fn transactional_failure_does_not_fail_ingestion() {
    let h = harness();
    // No provider configured: dispatch logs and swallows.
    h.db.with_tx(|conn| {
        catalog::transaction_insert(
            conn,
            &segflow_core::types::Transaction {
                id: "purchase".to_string(),
                event: "purchase".to_string(),
                subject: "s".to_string(),
                html: "h".to_string(),
                preamble: String::new(),
            },
        )
    })
    .unwrap();
    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "e@x"})))
        .unwrap();

    let event = h
        .services
        .emit_event("u1", "purchase", Attributes::new())
        .unwrap();
    assert_eq!(event.name, "purchase");
    assert_eq!(h.sender.count(), 0);

    // The event row committed regardless.
    assert_eq!(h.services.list_user_events("u1").unwrap().len(), 1);
}

#[test]
fn events_trigger_only_matching_segments() {
    let h = harness();
    h.services
        .create_segment(
            "buyers",
            "SELECT DISTINCT events.user_id AS id FROM events WHERE events.name = 'purchase'",
        )
        .unwrap();
    h.services
        .create_campaign(
            "c",
            r#"wait(#{days: 30});"#,
            vec!["buyers".to_string()],
            vec![],
            CampaignBehavior::Static,
        )
        .unwrap();
    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "a@x"})))
        .unwrap();

    assert!(h.services.list_user_segments("u1").unwrap().is_empty());

    h.services
        .emit_event("u1", "browse", Attributes::new())
        .unwrap();
    assert!(h.services.list_user_segments("u1").unwrap().is_empty());

    h.services
        .emit_event("u1", "purchase", Attributes::new())
        .unwrap();
    assert_eq!(h.services.list_user_segments("u1").unwrap(), vec!["buyers"]);
    h.db.with_tx(|conn| {
        assert!(campaigns::is_member(conn, "u1", "c")?);
        assert!(executions::get(conn, "u1", "c")?.is_some());
        Ok(())
    })
    .unwrap();
}

#[test]
fn segment_delete_is_rejected_while_referenced() {
    let h = harness();
    h.services
        .create_segment("all", "SELECT id FROM users")
        .unwrap();
    h.services
        .create_campaign(
            "c",
            r#"wait(#{days: 1});"#,
            vec!["all".to_string()],
            vec![],
            CampaignBehavior::Static,
        )
        .unwrap();

    let err = h.services.delete_segment("all").unwrap_err();
    assert!(matches!(err, EngineError::Constraint(_)));

    h.services.delete_campaign("c").unwrap();
    h.services.delete_segment("all").unwrap();
}

#[test]
fn reevaluating_unchanged_attributes_is_a_no_op() {
    let h = harness();
    h.services.create_segment("active", ACTIVE_SEGMENT).unwrap();
    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "a@x", "active": true})))
        .unwrap();
    assert_eq!(h.services.list_user_segments("u1").unwrap(), vec!["active"]);

    h.services
        .update_user("u1", attrs(serde_json::json!({"active": true})))
        .unwrap();
    assert_eq!(h.services.list_user_segments("u1").unwrap(), vec!["active"]);
}

// ─── Configuration pushes ──────────────────────────────────────────────────

fn sample_document() -> ConfigDocument {
    let mut templates = BTreeMap::new();
    templates.insert(
        "welcome".to_string(),
        TemplateSpec {
            subject: "Welcome, <%= user.name %>".to_string(),
            html: "<p>Hi <%= user.name %></p>".to_string(),
            preamble: String::new(),
        },
    );
    let mut segments_map = BTreeMap::new();
    segments_map.insert(
        "all".to_string(),
        SegmentSpec {
            evaluator: "SELECT id FROM users".to_string(),
        },
    );
    let mut campaigns_map = BTreeMap::new();
    campaigns_map.insert(
        "c".to_string(),
        CampaignSpec {
            flow: r#"send_email("welcome");"#.to_string(),
            segments: vec!["all".to_string()],
            exclude_segments: vec![],
            behavior: CampaignBehavior::Static,
        },
    );
    ConfigDocument {
        templates,
        segments: segments_map,
        campaigns: campaigns_map,
        transactions: BTreeMap::new(),
        email_provider: Some(provider()),
    }
}

#[test]
fn config_push_applies_then_idempotent_then_deletes() {
    let h = harness();
    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "a@x"})))
        .unwrap();

    // First push: everything lands, matching users get pending executions.
    let outcome = h.services.push_config(sample_document()).unwrap();
    assert!(matches!(outcome, PushOutcome::Applied { .. }));
    h.db.with_tx(|conn| {
        assert!(segments::get(conn, "all")?.is_some());
        assert!(campaigns::get(conn, "c")?.is_some());
        assert!(catalog::template_get(conn, "welcome")?.is_some());
        let execution = executions::get(conn, "u1", "c")?.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(configs::count(conn)?, 1);
        Ok(())
    })
    .unwrap();

    // Identical push: no changes, no ledger growth, no duplicate work.
    let outcome = h.services.push_config(sample_document()).unwrap();
    assert_eq!(outcome, PushOutcome::NoChanges);
    h.db.with_tx(|conn| {
        assert_eq!(configs::count(conn)?, 1);
        Ok(())
    })
    .unwrap();

    // Push without the campaign: executions terminated and removed,
    // memberships gone.
    let mut without_campaign = sample_document();
    without_campaign.campaigns.clear();
    let outcome = h.services.push_config(without_campaign).unwrap();
    assert!(matches!(outcome, PushOutcome::Applied { .. }));
    h.db.with_tx(|conn| {
        assert!(campaigns::get(conn, "c")?.is_none());
        assert!(executions::get(conn, "u1", "c")?.is_none());
        assert!(!campaigns::is_member(conn, "u1", "c")?);
        assert_eq!(configs::count(conn)?, 2);
        Ok(())
    })
    .unwrap();
}

#[test]
fn config_push_drives_the_onboarding_scenario_end_to_end() {
    let h = harness();
    h.services.push_config(sample_document()).unwrap();
    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "a@x", "name": "A"})))
        .unwrap();

    h.executor.tick().unwrap();
    assert_eq!(h.sender.count(), 1);
    let email = &h.sender.sent()[0];
    assert_eq!(email.subject, "Welcome, A");
    assert!(email.html.contains("Hi A"));

    h.executor.tick().unwrap();
    h.db.with_tx(|conn| {
        assert_eq!(
            executions::get(conn, "u1", "c")?.unwrap().status,
            ExecutionStatus::Completed
        );
        Ok(())
    })
    .unwrap();
    assert_eq!(h.sender.count(), 1);
}

#[test]
fn campaign_updates_via_push_are_unsupported() {
    let h = harness();
    h.services.push_config(sample_document()).unwrap();

    let mut changed = sample_document();
    changed.campaigns.get_mut("c").unwrap().behavior = CampaignBehavior::Dynamic;
    let err = h.services.push_config(changed).unwrap_err();
    assert!(matches!(err, EngineError::Unsupported(_)));

    // Nothing was applied and no ledger row was written.
    h.db.with_tx(|conn| {
        assert_eq!(configs::count(conn)?, 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn campaigns_referencing_unknown_segments_are_rejected() {
    let h = harness();
    let mut document = sample_document();
    document.segments.clear();
    let err = h.services.push_config(document).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[test]
fn segment_order_differences_are_not_campaign_changes() {
    let h = harness();
    let mut document = sample_document();
    document.segments.insert(
        "active".to_string(),
        SegmentSpec {
            evaluator: ACTIVE_SEGMENT.to_string(),
        },
    );
    document.campaigns.get_mut("c").unwrap().segments =
        vec!["all".to_string(), "active".to_string()];
    h.services.push_config(document.clone()).unwrap();

    // Same campaign with the include list reordered: no changes.
    document.campaigns.get_mut("c").unwrap().segments =
        vec!["active".to_string(), "all".to_string()];
    let outcome = h.services.push_config(document).unwrap();
    assert_eq!(outcome, PushOutcome::NoChanges);
}

#[test]
fn transactions_arrive_via_config_push() {
    let h = harness();
    let mut document = sample_document();
    document.transactions.insert(
        "purchase".to_string(),
        TransactionSpec {
            event: "purchase".to_string(),
            subject: "Order <%= event.id %>".to_string(),
            html: "<%= user.name %>: $<%= event.amount %>".to_string(),
            preamble: String::new(),
        },
    );
    h.services.push_config(document).unwrap();

    h.services
        .create_user("u1", attrs(serde_json::json!({"email": "e@x", "name": "N"})))
        .unwrap();
    h.services
        .emit_event(
            "u1",
            "purchase",
            attrs(serde_json::json!({"id": "o1", "amount": 42})),
        )
        .unwrap();

    let subjects: Vec<String> = h.sender.sent().iter().map(|m| m.subject.clone()).collect();
    assert!(subjects.contains(&"Order o1".to_string()));
}
