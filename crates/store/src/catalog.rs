//! Templates, transactional emails and the email-provider singleton.

use rusqlite::{params, Connection, OptionalExtension};
use segflow_core::types::{EmailProvider, Template, Transaction};
use segflow_core::{EngineError, SegflowResult};

// ─── Templates ──────────────────────────────────────────────────────────────

pub fn template_insert(conn: &Connection, template: &Template) -> SegflowResult<()> {
    conn.execute(
        "INSERT INTO templates (id, subject, html, preamble) VALUES (?1, ?2, ?3, ?4)",
        params![template.id, template.subject, template.html, template.preamble],
    )?;
    Ok(())
}

pub fn template_update(conn: &Connection, template: &Template) -> SegflowResult<()> {
    conn.execute(
        "UPDATE templates SET subject = ?2, html = ?3, preamble = ?4 WHERE id = ?1",
        params![template.id, template.subject, template.html, template.preamble],
    )?;
    Ok(())
}

pub fn template_get(conn: &Connection, id: &str) -> SegflowResult<Option<Template>> {
    let row = conn
        .query_row(
            "SELECT id, subject, html, preamble FROM templates WHERE id = ?1",
            params![id],
            |row| {
                Ok(Template {
                    id: row.get(0)?,
                    subject: row.get(1)?,
                    html: row.get(2)?,
                    preamble: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn template_require(conn: &Connection, id: &str) -> SegflowResult<Template> {
    template_get(conn, id)?.ok_or_else(|| EngineError::not_found("template", id))
}

pub fn template_delete(conn: &Connection, id: &str) -> SegflowResult<bool> {
    let rows = conn.execute("DELETE FROM templates WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

// ─── Transactions ───────────────────────────────────────────────────────────

pub fn transaction_insert(conn: &Connection, transaction: &Transaction) -> SegflowResult<()> {
    conn.execute(
        "INSERT INTO transactions (id, event, subject, html, preamble)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            transaction.id,
            transaction.event,
            transaction.subject,
            transaction.html,
            transaction.preamble
        ],
    )?;
    Ok(())
}

pub fn transaction_update(conn: &Connection, transaction: &Transaction) -> SegflowResult<()> {
    conn.execute(
        "UPDATE transactions SET event = ?2, subject = ?3, html = ?4, preamble = ?5
         WHERE id = ?1",
        params![
            transaction.id,
            transaction.event,
            transaction.subject,
            transaction.html,
            transaction.preamble
        ],
    )?;
    Ok(())
}

pub fn transaction_delete(conn: &Connection, id: &str) -> SegflowResult<bool> {
    let rows = conn.execute("DELETE FROM transactions WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// First transaction registered for the event name, by id order.
pub fn transaction_for_event(
    conn: &Connection,
    event_name: &str,
) -> SegflowResult<Option<Transaction>> {
    let row = conn
        .query_row(
            "SELECT id, event, subject, html, preamble FROM transactions
             WHERE event = ?1 ORDER BY id LIMIT 1",
            params![event_name],
            |row| {
                Ok(Transaction {
                    id: row.get(0)?,
                    event: row.get(1)?,
                    subject: row.get(2)?,
                    html: row.get(3)?,
                    preamble: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

// ─── Email provider singleton ───────────────────────────────────────────────

/// Truncate-then-insert: exactly one provider row, id 1.
pub fn provider_set(conn: &Connection, provider: &EmailProvider) -> SegflowResult<()> {
    conn.execute("DELETE FROM email_provider", [])?;
    conn.execute(
        "INSERT INTO email_provider (id, config, from_address) VALUES (1, ?1, ?2)",
        params![
            serde_json::to_string(&provider.config)?,
            provider.from_address
        ],
    )?;
    Ok(())
}

pub fn provider_clear(conn: &Connection) -> SegflowResult<()> {
    conn.execute("DELETE FROM email_provider", [])?;
    Ok(())
}

pub fn provider_get(conn: &Connection) -> SegflowResult<Option<EmailProvider>> {
    let row = conn
        .query_row(
            "SELECT config, from_address FROM email_provider WHERE id = 1",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    match row {
        Some((config, from_address)) => Ok(Some(EmailProvider {
            config: serde_json::from_str(&config)?,
            from_address,
        })),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use segflow_core::types::EmailProviderConfig;

    #[test]
    fn provider_is_a_singleton() {
        let db = Database::open_memory().unwrap();
        db.with_tx(|conn| {
            provider_set(
                conn,
                &EmailProvider {
                    config: EmailProviderConfig::Postmark {
                        api_key: "pm-1".to_string(),
                    },
                    from_address: "one@x".to_string(),
                },
            )?;
            provider_set(
                conn,
                &EmailProvider {
                    config: EmailProviderConfig::Postmark {
                        api_key: "pm-2".to_string(),
                    },
                    from_address: "two@x".to_string(),
                },
            )?;

            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM email_provider", [], |row| row.get(0))
                .map_err(EngineError::from)?;
            assert_eq!(count, 1);

            let provider = provider_get(conn)?.unwrap();
            assert_eq!(provider.from_address, "two@x");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn first_transaction_wins_for_an_event() {
        let db = Database::open_memory().unwrap();
        db.with_tx(|conn| {
            for id in ["a-first", "b-second"] {
                transaction_insert(
                    conn,
                    &Transaction {
                        id: id.to_string(),
                        event: "purchase".to_string(),
                        subject: "s".to_string(),
                        html: "h".to_string(),
                        preamble: String::new(),
                    },
                )?;
            }
            let found = transaction_for_event(conn, "purchase")?.unwrap();
            assert_eq!(found.id, "a-first");
            assert!(transaction_for_event(conn, "refund")?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
