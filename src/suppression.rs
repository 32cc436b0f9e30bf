/*
📌 Suppression Registry
✅ Session-scoped stack of (table, policy) entries currently disabled
✅ RAII guard: release happens on every exit path, including unwinds
✅ Nesting: suppressing twice requires two releases
✅ Concurrent sessions never observe each other's stack
*/

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{PolicyError, PolicyResult};

/// Process-wide registry of per-session suppression stacks. Cloning shares
/// the underlying state.
#[derive(Clone)]
pub struct SuppressionRegistry {
    sessions: Arc<DashMap<String, Vec<(String, String)>>>,
}

impl SuppressionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Disable (table, policy) for this session until the guard is dropped
    pub fn suppress(&self, session: &str, table: &str, policy: &str) -> SuppressionGuard {
        self.sessions
            .entry(session.to_string())
            .or_insert_with(Vec::new)
            .push((table.to_string(), policy.to_string()));

        log::debug!(
            "suppressed ({}, {}) in session {} (depth {})",
            table,
            policy,
            session,
            self.depth(session, table, policy)
        );

        SuppressionGuard {
            registry: self.clone(),
            session: session.to_string(),
            table: table.to_string(),
            policy: policy.to_string(),
            released: false,
        }
    }

    /// Checked by every compiled trigger before applying its action
    pub fn is_suppressed(&self, session: &str, table: &str, policy: &str) -> bool {
        self.depth(session, table, policy) > 0
    }

    /// Current nesting depth of one entry in one session
    pub fn depth(&self, session: &str, table: &str, policy: &str) -> usize {
        self.sessions
            .get(session)
            .map(|stack| {
                stack
                    .iter()
                    .filter(|(t, p)| t == table && p == policy)
                    .count()
            })
            .unwrap_or(0)
    }

    /// All entries currently suppressed in a session, in acquisition order
    pub fn active(&self, session: &str) -> Vec<(String, String)> {
        self.sessions
            .get(session)
            .map(|stack| stack.clone())
            .unwrap_or_default()
    }

    /// Pop the most recent matching entry. Releasing an entry that was never
    /// acquired is a programming error and reported immediately.
    pub fn release(&self, session: &str, table: &str, policy: &str) -> PolicyResult<()> {
        let emptied = {
            let mut stack = match self.sessions.get_mut(session) {
                Some(stack) => stack,
                None => {
                    return Err(PolicyError::suppression_misuse(session, table, policy));
                }
            };
            let position = stack
                .iter()
                .rposition(|(t, p)| t == table && p == policy)
                .ok_or_else(|| PolicyError::suppression_misuse(session, table, policy))?;
            stack.remove(position);
            stack.is_empty()
        };

        if emptied {
            self.sessions.remove_if(session, |_, stack| stack.is_empty());
        }
        Ok(())
    }
}

impl Default for SuppressionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope token returned by `suppress`. Dropping it pops the entry; `release`
/// pops it explicitly and surfaces any misuse error.
pub struct SuppressionGuard {
    registry: SuppressionRegistry,
    session: String,
    table: String,
    policy: String,
    released: bool,
}

impl SuppressionGuard {
    pub fn release(mut self) -> PolicyResult<()> {
        self.released = true;
        self.registry
            .release(&self.session, &self.table, &self.policy)
    }
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self
            .registry
            .release(&self.session, &self.table, &self.policy)
        {
            // Double release can only happen through registry misuse
            log::error!("suppression guard drop failed: {}", err);
        }
    }
}
