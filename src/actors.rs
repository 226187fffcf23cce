//! Actor directory.
//!
//! Links session participants to canonical actor ids so searches can be
//! scoped to "this user across sessions". Built during session sync from
//! the external session store snapshot; the indexer references actors but
//! never deletes them (their lifecycle belongs to the session store).

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::path::Path;

use crate::models::{ActorMatch, ActorType, ChatType};

/// Per-session identity derived from one snapshot entry.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_key: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub channel: Option<String>,
    pub origin_label: Option<String>,
    pub chat_type: Option<ChatType>,
}

/// Raw snapshot entry as the session store writes it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEntry {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    origin: Option<SnapshotOrigin>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    chat_type: Option<String>,
    #[serde(default)]
    last_channel: Option<String>,
    #[serde(default)]
    delivery_context: Option<SnapshotDelivery>,
    #[serde(default)]
    last_to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotOrigin {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotDelivery {
    #[serde(default)]
    to: Option<String>,
}

/// Read the session store snapshot. A missing file is an empty store, not
/// an error: the agent may simply never have had a session.
pub fn load_session_store(path: &Path) -> Result<Vec<SessionIdentity>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read session store: {}", path.display()))?;
    let entries: HashMap<String, SnapshotEntry> =
        serde_json::from_str(&raw).with_context(|| "Failed to parse session store snapshot")?;

    let mut identities: Vec<SessionIdentity> = entries
        .into_iter()
        .map(|(session_key, entry)| {
            let user_id = entry
                .origin
                .as_ref()
                .and_then(|o| trimmed(&o.from))
                .or_else(|| {
                    entry
                        .delivery_context
                        .as_ref()
                        .and_then(|d| trimmed(&d.to))
                })
                .or_else(|| trimmed(&entry.last_to));
            let channel = trimmed(&entry.channel)
                .or_else(|| trimmed(&entry.last_channel))
                .or_else(|| entry.origin.as_ref().and_then(|o| trimmed(&o.provider)));
            let origin_label = entry.origin.as_ref().and_then(|o| trimmed(&o.label));
            let chat_type = match entry.chat_type.as_deref() {
                Some("direct") => Some(ChatType::Direct),
                Some("group") => Some(ChatType::Group),
                _ => None,
            };
            SessionIdentity {
                session_key,
                session_id: trimmed(&entry.session_id),
                user_id,
                channel,
                origin_label,
                chat_type,
            }
        })
        .collect();
    identities.sort_by(|a, b| a.session_key.cmp(&b.session_key));
    Ok(identities)
}

/// Index identities by transcript id for the session indexer's lookups.
pub fn by_session_id(identities: &[SessionIdentity]) -> HashMap<String, &SessionIdentity> {
    identities
        .iter()
        .filter_map(|identity| {
            identity
                .session_id
                .as_ref()
                .map(|id| (id.clone(), identity))
        })
        .collect()
}

/// Upsert actors and aliases from the snapshot. The agent itself always
/// gets a synthetic actor row.
pub async fn sync_actors(
    pool: &PgPool,
    identities: &[SessionIdentity],
    agent_actor_id: &str,
    agent_label: &str,
) -> Result<()> {
    upsert_actor(pool, agent_actor_id, ActorType::Agent, Some(agent_label)).await?;

    for identity in identities {
        let Some(user_id) = &identity.user_id else {
            continue;
        };
        upsert_actor(
            pool,
            user_id,
            ActorType::Human,
            identity.origin_label.as_deref(),
        )
        .await?;

        if let Some(label) = &identity.origin_label {
            let alias_norm = label.trim().to_lowercase();
            if alias_norm.is_empty() {
                continue;
            }
            sqlx::query(
                "INSERT INTO memory_actor_aliases \
                   (alias_norm, actor_id, alias, source, confidence, updated_at) \
                 VALUES ($1, $2, $3, $4, 1, now()) \
                 ON CONFLICT (alias_norm, actor_id) DO UPDATE \
                   SET alias = EXCLUDED.alias, source = EXCLUDED.source, \
                       confidence = EXCLUDED.confidence, updated_at = now()",
            )
            .bind(&alias_norm)
            .bind(user_id)
            .bind(label.trim())
            .bind(&identity.channel)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

async fn upsert_actor(
    pool: &PgPool,
    actor_id: &str,
    actor_type: ActorType,
    display_name: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO memory_actors (actor_id, actor_type, display_name, updated_at) \
         VALUES ($1, $2, $3, now()) \
         ON CONFLICT (actor_id) DO UPDATE \
           SET actor_type = EXCLUDED.actor_type, \
               display_name = COALESCE(EXCLUDED.display_name, memory_actors.display_name), \
               updated_at = now()",
    )
    .bind(actor_id)
    .bind(actor_type.as_str())
    .bind(display_name)
    .execute(pool)
    .await?;
    Ok(())
}

/// Find actors whose display name, alias, or id contains `query`,
/// case-insensitively. Grouped per actor, best alias confidence first.
pub async fn lookup_actors(pool: &PgPool, query: &str, limit: usize) -> Result<Vec<ActorMatch>> {
    let limit = limit.clamp(1, 50) as i64;
    let pattern = format!("%{}%", escape_like(query.trim()));

    let rows = sqlx::query(
        "SELECT a.actor_id, a.actor_type, a.display_name, \
                COALESCE(MAX(al.confidence), 0) AS confidence, \
                COALESCE(ARRAY_REMOVE(ARRAY_AGG(DISTINCT al.alias), NULL), ARRAY[]::text[]) AS aliases \
         FROM memory_actors a \
         LEFT JOIN memory_actor_aliases al ON al.actor_id = a.actor_id \
         WHERE a.display_name ILIKE $1 OR a.actor_id ILIKE $1 OR al.alias ILIKE $1 \
         GROUP BY a.actor_id, a.actor_type, a.display_name \
         ORDER BY confidence DESC, a.display_name ASC NULLS LAST, a.actor_id ASC \
         LIMIT $2",
    )
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ActorMatch {
            actor_id: row.get("actor_id"),
            actor_type: row.get("actor_type"),
            display_name: row.get("display_name"),
            confidence: row.get("confidence"),
            aliases: row.get("aliases"),
        })
        .collect())
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn snapshot_parses_identity_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "agent:a:tg:direct:7": {{
                    "sessionId": "s-123",
                    "origin": {{"provider": "telegram", "from": "tg:+1234", "label": "Alice"}},
                    "channel": "telegram",
                    "chatType": "direct"
                }},
                "agent:a:disc:group:9": {{
                    "sessionId": "s-456",
                    "lastChannel": "discord",
                    "chatType": "group",
                    "deliveryContext": {{"to": "disc:42"}}
                }}
            }}"#
        )
        .unwrap();

        let identities = load_session_store(file.path()).unwrap();
        assert_eq!(identities.len(), 2);

        let direct = &identities[1];
        assert_eq!(direct.session_key, "agent:a:tg:direct:7");
        assert_eq!(direct.user_id.as_deref(), Some("tg:+1234"));
        assert_eq!(direct.origin_label.as_deref(), Some("Alice"));
        assert_eq!(direct.channel.as_deref(), Some("telegram"));
        assert_eq!(direct.chat_type, Some(ChatType::Direct));

        let group = &identities[0];
        assert_eq!(group.user_id.as_deref(), Some("disc:42"));
        assert_eq!(group.channel.as_deref(), Some("discord"));
        assert_eq!(group.chat_type, Some(ChatType::Group));
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let identities =
            load_session_store(Path::new("/nonexistent/sessions.json")).unwrap();
        assert!(identities.is_empty());
    }

    #[test]
    fn by_session_id_skips_entries_without_ids() {
        let identities = vec![
            SessionIdentity {
                session_key: "k1".into(),
                session_id: Some("s1".into()),
                user_id: None,
                channel: None,
                origin_label: None,
                chat_type: None,
            },
            SessionIdentity {
                session_key: "k2".into(),
                session_id: None,
                user_id: None,
                channel: None,
                origin_label: None,
                chat_type: None,
            },
        ];
        let index = by_session_id(&identities);
        assert_eq!(index.len(), 1);
        assert_eq!(index["s1"].session_key, "k1");
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("50%_a\\b"), "50\\%\\_a\\\\b");
    }
}
