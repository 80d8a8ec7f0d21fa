//! Turn Bookkeeping
//!
//! Pending confirmations and the cancel handles of running turns, both keyed
//! by conversation. A confirmation is a oneshot: the loop awaits the receiver
//! and the WebSocket `confirm` command completes the sender.
//!
//! Entries are tagged with a ticket or generation so that cleanup of a
//! finished wait or turn never removes a newer one for the same conversation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agent_core::error::Result;
use agent_core::reasoning::ApprovalGate;
use agent_core::session::ConversationId;
use agent_core::tool::ToolCall;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Waiting {
    ticket: u64,
    sender: oneshot::Sender<HashSet<String>>,
}

/// Confirmations waiting for a client decision
#[derive(Default)]
pub struct PendingApprovals {
    waiting: Mutex<HashMap<ConversationId, Waiting>>,
    tickets: AtomicU64,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the pending confirmation. `false` when nothing was waiting.
    pub fn resolve(&self, id: &ConversationId, approved: HashSet<String>) -> bool {
        match lock(&self.waiting).remove(id) {
            Some(waiting) => waiting.sender.send(approved).is_ok(),
            None => false,
        }
    }

    /// Drop a pending confirmation; the waiting turn rejects its calls
    pub fn discard(&self, id: &ConversationId) {
        lock(&self.waiting).remove(id);
    }

    pub fn is_waiting(&self, id: &ConversationId) -> bool {
        lock(&self.waiting).contains_key(id)
    }
}

/// Removes its own `waiting` entry however `decide` exits
struct WaitingEntry<'a> {
    approvals: &'a PendingApprovals,
    id: ConversationId,
    ticket: u64,
}

impl Drop for WaitingEntry<'_> {
    fn drop(&mut self) {
        let mut waiting = lock(&self.approvals.waiting);
        if waiting.get(&self.id).is_some_and(|w| w.ticket == self.ticket) {
            waiting.remove(&self.id);
        }
    }
}

#[async_trait]
impl ApprovalGate for PendingApprovals {
    async fn decide(&self, conversation_id: &ConversationId, pending: &[ToolCall]) -> Result<HashSet<String>> {
        let (sender, receiver) = oneshot::channel();
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        lock(&self.waiting).insert(conversation_id.clone(), Waiting { ticket, sender });
        let _entry = WaitingEntry {
            approvals: self,
            id: conversation_id.clone(),
            ticket,
        };
        tracing::info!(conversation_id = %conversation_id, calls = pending.len(), "waiting for confirmation");

        let offered: HashSet<&str> = pending.iter().map(|c| c.id.as_str()).collect();
        Ok(receiver
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|id| offered.contains(id.as_str()))
            .collect())
    }
}

/// Rejects every call that needs confirmation (no client to ask)
pub struct RejectAll;

#[async_trait]
impl ApprovalGate for RejectAll {
    async fn decide(&self, conversation_id: &ConversationId, pending: &[ToolCall]) -> Result<HashSet<String>> {
        tracing::warn!(conversation_id = %conversation_id, calls = pending.len(), "no client to confirm, rejecting");
        Ok(HashSet::new())
    }
}

struct Running {
    generation: u64,
    cancel: CancellationToken,
}

/// Cancel handles of running turns
#[derive(Default)]
pub struct ActiveTurns {
    turns: Mutex<HashMap<ConversationId, Running>>,
    generations: AtomicU64,
}

impl ActiveTurns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a turn; `None` while another turn of the conversation runs.
    ///
    /// The turn stays registered until the returned guard is dropped.
    pub fn start(self: &Arc<Self>, id: &ConversationId) -> Option<TurnGuard> {
        let mut turns = lock(&self.turns);
        if turns.contains_key(id) {
            return None;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        turns.insert(
            id.clone(),
            Running {
                generation,
                cancel: cancel.clone(),
            },
        );
        Some(TurnGuard {
            turns: Arc::clone(self),
            id: id.clone(),
            generation,
            cancel,
        })
    }

    /// Fire the running turn's token. `false` when no turn is running.
    pub fn cancel(&self, id: &ConversationId) -> bool {
        match lock(&self.turns).get(id) {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Like [`cancel`](Self::cancel), but only if `generation` is still the running turn
    pub fn cancel_generation(&self, id: &ConversationId, generation: u64) -> bool {
        match lock(&self.turns).get(id) {
            Some(running) if running.generation == generation => {
                running.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self, id: &ConversationId) -> bool {
        lock(&self.turns).contains_key(id)
    }

    fn release(&self, id: &ConversationId, generation: u64) {
        let mut turns = lock(&self.turns);
        if turns.get(id).is_some_and(|r| r.generation == generation) {
            turns.remove(id);
        }
    }
}

/// Registration of one running turn; dropping it cancels and unregisters the turn
pub struct TurnGuard {
    turns: Arc<ActiveTurns>,
    id: ConversationId,
    generation: u64,
    cancel: CancellationToken,
}

impl TurnGuard {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.turns.release(&self.id, self.generation);
    }
}
