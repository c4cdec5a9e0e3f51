//! Bounded per-session conversation memory.
//!
//! A [`Session`] is an append-only log of [`Turn`]s. Once the configured
//! [`MemoryBudget`] is exceeded the oldest turns are evicted first; the most
//! recent turn is always kept. Sessions are independent: [`SessionStore`]
//! gives each one its own mutex and never locks across sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{CopilotError, Result};

/// Rough chars-per-token ratio used for budgeting.
const CHARS_PER_TOKEN: usize = 4;

/// One question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub query: String,
    pub answer: String,
    /// Ids of the chunks supplied as evidence.
    pub evidence: Vec<String>,
    /// Citation identifiers that appeared in the answer.
    pub citations: Vec<u32>,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(query: &str, answer: &str, evidence: Vec<String>, citations: Vec<u32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.to_string(),
            answer: answer.to_string(),
            evidence,
            citations,
            at: Utc::now(),
        }
    }

    pub fn estimated_tokens(&self) -> usize {
        let chars = self.query.chars().count() + self.answer.chars().count();
        chars.div_ceil(CHARS_PER_TOKEN)
    }
}

/// Turn and token caps for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    pub max_turns: usize,
    pub max_tokens: usize,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            max_turns: 6,
            max_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    turns: VecDeque<Turn>,
}

impl Session {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            turns: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a turn and evict from the front until the budget fits.
    /// Returns the number of evicted turns.
    pub fn append(&mut self, turn: Turn, budget: &MemoryBudget) -> usize {
        self.turns.push_back(turn);
        let mut evicted = 0;
        while self.turns.len() > 1
            && (self.turns.len() > budget.max_turns || self.total_tokens() > budget.max_tokens)
        {
            self.turns.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Most recent turns that fit `budget`, oldest first. The latest turn
    /// is included even when it alone exceeds the token cap.
    pub fn recent_turns(&self, budget: &MemoryBudget) -> Vec<Turn> {
        let mut picked: Vec<Turn> = Vec::new();
        let mut tokens = 0usize;
        for turn in self.turns.iter().rev() {
            let cost = turn.estimated_tokens();
            let full = picked.len() >= budget.max_turns || tokens + cost > budget.max_tokens;
            if !picked.is_empty() && full {
                break;
            }
            tokens += cost;
            picked.push(turn.clone());
        }
        picked.reverse();
        picked
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    fn total_tokens(&self) -> usize {
        self.turns.iter().map(Turn::estimated_tokens).sum()
    }
}

/// All live sessions, each behind its own lock.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<AsyncMutex<Session>>>>,
    budget: MemoryBudget,
}

impl SessionStore {
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            budget,
        }
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    /// Open a fresh session and return its id. The only way a session
    /// comes into existence.
    pub fn create(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.sessions.lock().map_err(CopilotError::store)?;
        sessions.insert(id.clone(), Arc::new(AsyncMutex::new(Session::new(&id))));
        Ok(id)
    }

    /// Handle to an existing session.
    pub fn get(&self, id: &str) -> Result<Arc<AsyncMutex<Session>>> {
        if id.trim().is_empty() {
            return Err(CopilotError::InvalidInput("session id is empty".into()));
        }
        let sessions = self.sessions.lock().map_err(CopilotError::store)?;
        sessions
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| CopilotError::SessionNotFound {
                session_id: id.to_string(),
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .map(|s| s.contains_key(id))
            .unwrap_or(false)
    }

    pub async fn append(&self, session_id: &str, turn: Turn) -> Result<()> {
        let session = self.get(session_id)?;
        let evicted = session.lock().await.append(turn, &self.budget);
        if evicted > 0 {
            debug!(session = session_id, evicted, "evicted old turns");
        }
        Ok(())
    }

    pub async fn recent_turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        let session = self.get(session_id)?;
        let guard = session.lock().await;
        Ok(guard.recent_turns(&self.budget))
    }

    /// Forget a session's turns but keep the session.
    pub async fn reset(&self, session_id: &str) -> Result<()> {
        let session = self.get(session_id)?;
        session.lock().await.clear();
        Ok(())
    }

    /// Destroy a session. Returns whether it existed.
    pub fn remove(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock().map_err(CopilotError::store)?;
        Ok(sessions.remove(session_id).is_some())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(MemoryBudget::default())
    }
}
