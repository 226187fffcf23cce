//! Query scope resolution.
//!
//! Decides, per query, which rows are searchable at all. This is the
//! privacy boundary of the index: a `session`-scoped search must never see
//! memory files or another session's rows, because its results may be
//! echoed into a multi-party conversation.
//!
//! [`resolve_scope`] is a pure function of the ambient context, the
//! explicit overrides, and the query text, so the whole decision table is
//! unit-testable without a store.

use crate::models::{ActorType, ChatType, ChunkRole, SessionScope};

/// Words that signal the question is about shared context rather than the
/// asker's own history. Matched case-insensitively on word boundaries.
const SHARED_CONTEXT_TOKENS: &[&str] = &[
    "we", "our", "us", "team", "group", "everyone", "anyone", "all", "channel", "server", "thread",
    "guild", "room", "together", "others", "people",
];

/// Ambient facts about the conversation a query arrives from.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub session_key: Option<String>,
    pub chat_type: Option<ChatType>,
    /// Counterparty actor, when the channel resolves one.
    pub actor_id: Option<String>,
}

/// Explicit filters supplied by the caller; these win over auto-detection.
#[derive(Debug, Clone, Default)]
pub struct ScopeOverrides {
    pub session_scope: Option<SessionScope>,
    pub actor_id: Option<String>,
    pub actor_type: Option<ActorType>,
    pub role: Option<ChunkRole>,
}

/// The concrete filter set a query runs under.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScope {
    pub scope: SessionScope,
    /// Set iff `scope == Session`.
    pub session_key: Option<String>,
    /// Set for `scope == Actor`, or when explicitly overridden.
    pub actor_id: Option<String>,
    pub actor_type: Option<ActorType>,
    pub role: Option<ChunkRole>,
}

/// Map ambient context + query text to a concrete scope.
///
/// Without an explicit `session_scope` override:
/// - a shared-context token in the query widens to `global`, except in
///   group chats where it stays `session`,
/// - a direct chat with a known counterparty narrows to `actor`,
/// - everything else stays `session`.
pub fn resolve_scope(ctx: &QueryContext, overrides: &ScopeOverrides, query: &str) -> ResolvedScope {
    let scope = overrides.session_scope.unwrap_or_else(|| {
        if query_mentions_shared_context(query) {
            if ctx.chat_type == Some(ChatType::Group) {
                SessionScope::Session
            } else {
                SessionScope::Global
            }
        } else if ctx.actor_id.is_some() && ctx.chat_type == Some(ChatType::Direct) {
            SessionScope::Actor
        } else {
            SessionScope::Session
        }
    });

    let actor_id = match scope {
        SessionScope::Actor => overrides.actor_id.clone().or_else(|| ctx.actor_id.clone()),
        _ => overrides.actor_id.clone(),
    };
    let actor_type = match (&overrides.actor_type, scope) {
        (Some(t), _) => Some(*t),
        (None, SessionScope::Actor) if actor_id.is_some() => Some(ActorType::Human),
        _ => None,
    };

    ResolvedScope {
        scope,
        session_key: match scope {
            SessionScope::Session => ctx.session_key.clone(),
            _ => None,
        },
        actor_id,
        actor_type,
        role: overrides.role,
    }
}

fn query_mentions_shared_context(query: &str) -> bool {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .any(|w| {
            let lower = w.to_lowercase();
            SHARED_CONTEXT_TOKENS.contains(&lower.as_str())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_ctx() -> QueryContext {
        QueryContext {
            session_key: Some("agent:a:tg:direct:7".to_string()),
            chat_type: Some(ChatType::Direct),
            actor_id: Some("tg:+1234".to_string()),
        }
    }

    #[test]
    fn direct_chat_with_actor_resolves_actor_scope() {
        let resolved = resolve_scope(
            &direct_ctx(),
            &ScopeOverrides::default(),
            "what did I say yesterday?",
        );
        assert_eq!(resolved.scope, SessionScope::Actor);
        assert_eq!(resolved.actor_id.as_deref(), Some("tg:+1234"));
        assert_eq!(resolved.actor_type, Some(ActorType::Human));
        assert_eq!(resolved.session_key, None);
    }

    #[test]
    fn shared_token_widens_to_global() {
        let resolved = resolve_scope(
            &direct_ctx(),
            &ScopeOverrides::default(),
            "what did we decide together?",
        );
        assert_eq!(resolved.scope, SessionScope::Global);
        assert_eq!(resolved.actor_id, None);
        assert_eq!(resolved.session_key, None);
    }

    #[test]
    fn shared_token_in_group_stays_session() {
        let ctx = QueryContext {
            session_key: Some("agent:a:chan:group:42".to_string()),
            chat_type: Some(ChatType::Group),
            actor_id: Some("tg:+1234".to_string()),
        };
        let resolved = resolve_scope(&ctx, &ScopeOverrides::default(), "what did the team plan?");
        assert_eq!(resolved.scope, SessionScope::Session);
        assert_eq!(
            resolved.session_key.as_deref(),
            Some("agent:a:chan:group:42")
        );
    }

    #[test]
    fn no_actor_defaults_to_session() {
        let ctx = QueryContext {
            session_key: Some("k".to_string()),
            chat_type: Some(ChatType::Direct),
            actor_id: None,
        };
        let resolved = resolve_scope(&ctx, &ScopeOverrides::default(), "notes on the budget");
        assert_eq!(resolved.scope, SessionScope::Session);
        assert_eq!(resolved.session_key.as_deref(), Some("k"));
    }

    #[test]
    fn group_chat_without_shared_token_stays_session() {
        let ctx = QueryContext {
            session_key: Some("k".to_string()),
            chat_type: Some(ChatType::Group),
            actor_id: Some("tg:+1".to_string()),
        };
        let resolved = resolve_scope(&ctx, &ScopeOverrides::default(), "budget notes");
        assert_eq!(resolved.scope, SessionScope::Session);
    }

    #[test]
    fn explicit_override_wins() {
        let overrides = ScopeOverrides {
            session_scope: Some(SessionScope::Global),
            ..Default::default()
        };
        let resolved = resolve_scope(&direct_ctx(), &overrides, "what did I say?");
        assert_eq!(resolved.scope, SessionScope::Global);
    }

    #[test]
    fn explicit_actor_filter_survives_any_scope() {
        let overrides = ScopeOverrides {
            session_scope: Some(SessionScope::Global),
            actor_id: Some("tg:+999".to_string()),
            actor_type: Some(ActorType::Human),
            role: Some(ChunkRole::User),
        };
        let resolved = resolve_scope(&direct_ctx(), &overrides, "anything");
        assert_eq!(resolved.actor_id.as_deref(), Some("tg:+999"));
        assert_eq!(resolved.role, Some(ChunkRole::User));
    }

    #[test]
    fn word_boundary_matching() {
        // "wealth" contains "we" but must not match
        let resolved = resolve_scope(
            &direct_ctx(),
            &ScopeOverrides::default(),
            "notes about wealth management",
        );
        assert_eq!(resolved.scope, SessionScope::Actor);

        let resolved = resolve_scope(&direct_ctx(), &ScopeOverrides::default(), "What did WE do?");
        assert_eq!(resolved.scope, SessionScope::Global);
    }

    #[test]
    fn resolution_is_pure() {
        let ctx = direct_ctx();
        let a = resolve_scope(&ctx, &ScopeOverrides::default(), "our roadmap");
        let b = resolve_scope(&ctx, &ScopeOverrides::default(), "our roadmap");
        assert_eq!(a, b);
    }
}
