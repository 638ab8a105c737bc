use std::collections::HashMap;
use crate::storage::command::Command;
use crate::storage::log::LogEntry;
use crate::xa::xid::Xid;

/// A transaction reconstructed from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTx {
    pub local_id: i32,
    pub xid: Xid,
    pub commands: Vec<Command>,
    pub tx_id: Option<i64>,
}

#[derive(Debug, Default)]
struct Pending {
    xid: Option<Xid>,
    commands: Vec<Command>,
    prepared: bool,
    commit: Option<(usize, i64)>,
    done: bool,
}

/// What recovery has to do with the transactions found in the log.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    /// Committed but not marked done, in commit order; must be replayed.
    pub to_replay: Vec<RecoveredTx>,
    /// Prepared without a decision; the coordinator has to resolve these.
    pub in_doubt: Vec<RecoveredTx>,
    /// Started but never prepared; implicitly rolled back.
    pub discarded: Vec<i32>,
}

impl RecoveryPlan {
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let mut order: Vec<i32> = Vec::new();
        let mut txs: HashMap<i32, Pending> = HashMap::new();

        for (position, entry) in entries.into_iter().enumerate() {
            let local_id = entry.local_id();
            let tx = txs.entry(local_id).or_insert_with(|| {
                order.push(local_id);
                Pending::default()
            });
            match entry {
                LogEntry::Start { xid, .. } => tx.xid = Some(xid),
                LogEntry::Command { command, .. } => tx.commands.push(command),
                LogEntry::Prepare { .. } => tx.prepared = true,
                LogEntry::Commit { tx_id, .. } => tx.commit = Some((position, tx_id)),
                LogEntry::Done { .. } => tx.done = true,
            }
        }

        let mut plan = RecoveryPlan::default();
        let mut committed: Vec<(usize, RecoveredTx)> = Vec::new();
        for local_id in order {
            let Some(tx) = txs.remove(&local_id) else { continue };
            if tx.done {
                continue;
            }
            let Some(xid) = tx.xid else {
                tracing::warn!(local_id, "log entries without a start entry, ignoring");
                continue;
            };
            let recovered = RecoveredTx {
                local_id,
                xid,
                commands: tx.commands,
                tx_id: tx.commit.map(|(_, id)| id),
            };
            match tx.commit {
                Some((position, _)) => committed.push((position, recovered)),
                None if tx.prepared => plan.in_doubt.push(recovered),
                None => plan.discarded.push(local_id),
            }
        }

        committed.sort_by_key(|(position, _)| *position);
        plan.to_replay = committed.into_iter().map(|(_, tx)| tx).collect();
        plan
    }

    pub fn is_clean(&self) -> bool {
        self.to_replay.is_empty() && self.in_doubt.is_empty() && self.discarded.is_empty()
    }
}
