use crate::engine::{AnalysisHandle, AnalysisLine, Engine, Limit};
use crate::error::Result;
use crate::tree::{GameTree, NodeId};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// One analysis, running or historical, anchored at a tree node.
pub struct AnalysisSession {
    engine_id: String,
    node: NodeId,
    san: Option<String>,
    handle: AnalysisHandle,
    running: bool,
}

impl AnalysisSession {
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// SAN of the anchor move, None when anchored at the root.
    pub fn san(&self) -> Option<&str> {
        self.san.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn lines(&self) -> Vec<AnalysisLine> {
        self.handle.lines()
    }
}

/// Tracks concurrent per-position analysis sessions.
///
/// An engine can have at most one running session process-wide; manual
/// "fixed" sessions and cursor-following auto sessions share that
/// exclusivity. Stopped sessions stay around as history until removed.
#[derive(Default)]
pub struct AnalysisManager {
    sessions: Vec<AnalysisSession>,
    // engine id -> index into sessions, for the single running session.
    running: HashMap<String, usize>,
    auto_engines: BTreeSet<String>,
    auto_multipv: u32,
}

impl AnalysisManager {
    pub fn new() -> AnalysisManager {
        AnalysisManager {
            auto_multipv: 5,
            ..AnalysisManager::default()
        }
    }

    pub fn sessions(&self) -> &[AnalysisSession] {
        &self.sessions
    }

    pub fn sessions_at(&self, node: NodeId) -> impl Iterator<Item = &AnalysisSession> {
        self.sessions.iter().filter(move |s| s.node == node)
    }

    pub fn is_running(&self, engine_id: &str) -> bool {
        self.running.contains_key(engine_id)
    }

    pub fn running_anchor(&self, engine_id: &str) -> Option<NodeId> {
        self.running.get(engine_id).map(|&idx| self.sessions[idx].node)
    }

    /// Open a new session for `engine_id` anchored at `node`. No-op when the
    /// engine already has a running session anywhere.
    pub fn start(
        &mut self,
        engine_id: &str,
        engine: &Arc<Mutex<Engine>>,
        tree: &GameTree,
        node: NodeId,
        multipv: u32,
        limit: &Limit,
    ) -> Result<()> {
        let fen = tree.root_fen();
        let moves = tree.uci_path(node);
        self.start_with(engine_id, node, tree.san(node).map(String::from), || {
            engine
                .lock()
                .unwrap()
                .analyse(fen.as_deref(), &moves, multipv, limit)
        })
    }

    fn start_with(
        &mut self,
        engine_id: &str,
        node: NodeId,
        san: Option<String>,
        spawn: impl FnOnce() -> Result<AnalysisHandle>,
    ) -> Result<()> {
        if self.running.contains_key(engine_id) {
            return Ok(());
        }
        let handle = spawn()?;
        info!("started analysis: {engine_id} at node {node}");
        self.sessions.push(AnalysisSession {
            engine_id: engine_id.to_string(),
            node,
            san,
            handle,
            running: true,
        });
        self.running
            .insert(engine_id.to_string(), self.sessions.len() - 1);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn start_detached(&mut self, engine_id: &str, node: NodeId) {
        self.start_with(engine_id, node, None, || {
            Ok(AnalysisHandle::detached(engine_id))
        })
        .unwrap();
    }

    /// End the engine's running session. The historical record remains.
    pub fn stop(&mut self, engine_id: &str) {
        if let Some(idx) = self.running.remove(engine_id) {
            info!("stopped analysis: {engine_id}");
            self.sessions[idx].handle.stop();
            self.sessions[idx].running = false;
        }
    }

    /// Delete the historical record for `(engine_id, node)`, stopping the
    /// session first if it is the running one.
    pub fn remove(&mut self, engine_id: &str, node: NodeId) {
        if self.running_anchor(engine_id) == Some(node) {
            self.stop(engine_id);
        }
        let mut removed = vec![];
        self.sessions.retain_with_index(|idx, s| {
            let keep = !(s.engine_id == engine_id && s.node == node);
            if !keep {
                removed.push(idx);
            }
            keep
        });
        // Re-point running indices past the removed entries.
        for idx in self.running.values_mut() {
            let shift = removed.iter().filter(|&&r| r < *idx).count();
            *idx -= shift;
        }
    }

    /// Stop the engine's running session before its process goes away.
    pub fn on_engine_closing(&mut self, engine_id: &str) {
        if self.is_running(engine_id) {
            self.stop(engine_id);
        }
    }

    pub fn add_auto(&mut self, engine_id: &str) {
        self.auto_engines.insert(engine_id.to_string());
    }

    pub fn remove_auto(&mut self, engine_id: &str) -> bool {
        let present = self.auto_engines.remove(engine_id);
        if present && self.is_running(engine_id) {
            self.stop(engine_id);
        }
        present
    }

    pub fn auto_engines(&self) -> impl Iterator<Item = &str> {
        self.auto_engines.iter().map(String::as_str)
    }

    pub fn set_auto_multipv(&mut self, multipv: u32) {
        self.auto_multipv = multipv;
    }

    /// Re-synchronize auto analysis with the cursor: a session running at a
    /// stale anchor is stopped, then (re)started at the cursor. Runs after
    /// every command.
    pub fn sync(&mut self, engines: &BTreeMap<String, Arc<Mutex<Engine>>>, tree: &GameTree) {
        let cursor = tree.cursor();
        for engine_id in self.auto_engines.clone() {
            let Some(engine) = engines.get(&engine_id) else {
                warn!("auto analysis engine {engine_id} is not loaded");
                continue;
            };
            let fen = tree.root_fen();
            let moves = tree.uci_path(cursor);
            let multipv = self.auto_multipv;
            self.sync_one(&engine_id, cursor, tree.san(cursor).map(String::from), || {
                engine
                    .lock()
                    .unwrap()
                    .analyse(fen.as_deref(), &moves, multipv, &Limit::default())
            });
        }
    }

    fn sync_one(
        &mut self,
        engine_id: &str,
        cursor: NodeId,
        san: Option<String>,
        spawn: impl FnOnce() -> Result<AnalysisHandle>,
    ) {
        if let Some(anchor) = self.running_anchor(engine_id) {
            if anchor != cursor {
                self.stop(engine_id);
            }
        }
        if let Err(e) = self.start_with(engine_id, cursor, san, spawn) {
            warn!("auto analysis failed for {engine_id}: {e}");
        }
    }
}

// Vec::retain with the element index, used to fix up the running-session
// index map after history removal.
trait RetainWithIndex<T> {
    fn retain_with_index(&mut self, f: impl FnMut(usize, &T) -> bool);
}

impl<T> RetainWithIndex<T> for Vec<T> {
    fn retain_with_index(&mut self, mut f: impl FnMut(usize, &T) -> bool) {
        let mut idx = 0;
        self.retain(|item| {
            let keep = f(idx, item);
            idx += 1;
            keep
        });
    }
}
