use crate::analysis::AnalysisManager;
use crate::clock::Clock;
use crate::coordinator::MatchCoordinator;
use crate::engine::{Engine, EngineBuilder, Limit};
use crate::error::{Error, Result};
use crate::player::EnginePlayer;
use crate::tree::{GameTree, ROOT};
use log::info;
use shakmaty::Color;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Everything one interactive session owns: the game tree, the loaded
/// engines, the running match and the analysis sessions.
///
/// The command loop calls `on_before_command` / `on_after_command` around
/// every command; both run to completion before the next command is read,
/// so all background resolutions land at well defined points.
pub struct Session {
    tree: GameTree,
    coordinator: MatchCoordinator,
    analysis: AnalysisManager,
    engines: BTreeMap<String, Arc<Mutex<Engine>>>,
}

impl Session {
    pub fn new() -> Session {
        Session {
            tree: GameTree::new(),
            coordinator: MatchCoordinator::new(),
            analysis: AnalysisManager::new(),
            engines: BTreeMap::new(),
        }
    }

    pub fn from_fen(fen: &str) -> Result<Session> {
        let mut session = Session::new();
        session.tree = GameTree::from_fen(fen)?;
        Ok(session)
    }

    pub fn tree(&self) -> &GameTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut GameTree {
        &mut self.tree
    }

    pub fn coordinator(&self) -> &MatchCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut MatchCoordinator {
        &mut self.coordinator
    }

    pub fn analysis(&self) -> &AnalysisManager {
        &self.analysis
    }

    pub fn analysis_mut(&mut self) -> &mut AnalysisManager {
        &mut self.analysis
    }

    pub fn on_before_command(&mut self) {
        self.coordinator.sync(&mut self.tree);
        self.analysis.sync(&self.engines, &self.tree);
    }

    pub fn on_after_command(&mut self) {
        self.coordinator.sync(&mut self.tree);
        self.analysis.sync(&self.engines, &self.tree);
    }

    /// Prompt text for the current position: move number plus SAN of the
    /// cursor move, empty at the root.
    pub fn prompt_label(&self) -> String {
        let cursor = self.tree.cursor();
        if cursor == ROOT {
            return String::new();
        }
        match (self.tree.move_number(cursor), self.tree.san(cursor)) {
            (Some(number), Some(san)) => format!("{number}{san}"),
            _ => String::new(),
        }
    }

    pub fn engine(&self, id: &str) -> Option<&Arc<Mutex<Engine>>> {
        self.engines.get(id)
    }

    pub fn engine_ids(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    pub fn load_engine(&mut self, id: &str, builder: EngineBuilder) -> Result<()> {
        if self.engines.contains_key(id) {
            return Err(Error::command(format!("engine {id} is already loaded")));
        }
        let engine = builder.open()?;
        info!("loaded engine {id}");
        self.engines
            .insert(id.to_string(), Arc::new(Mutex::new(engine)));
        Ok(())
    }

    /// Unload an engine, ending its analysis session first.
    pub fn close_engine(&mut self, id: &str) -> Result<()> {
        self.analysis.on_engine_closing(id);
        let engine = self
            .engines
            .remove(id)
            .ok_or_else(|| Error::command(format!("no engine {id}")))?;
        engine.lock().unwrap().shutdown()?;
        info!("closed engine {id}");
        Ok(())
    }

    /// Seat a loaded engine in the match. An engine cannot play and analyse
    /// at the same time; adding it while it is analysing is refused.
    pub fn add_engine_player(&mut self, id: &str, color: Color, limit: Limit) -> Result<()> {
        self.add_engine_player_with_clocks(id, color, limit, None, None)
    }

    /// Seat a loaded engine with the match clocks wired in, so its search
    /// limits follow the live remaining times of both sides.
    pub fn add_engine_player_with_clocks(
        &mut self,
        id: &str,
        color: Color,
        limit: Limit,
        white_clock: Option<Clock>,
        black_clock: Option<Clock>,
    ) -> Result<()> {
        if self.analysis.is_running(id) {
            return Err(Error::command(format!(
                "engine {id} is analysing; stop the analysis before seating it"
            )));
        }
        let engine = self
            .engines
            .get(id)
            .ok_or_else(|| Error::command(format!("no engine {id}")))?;
        engine.lock().unwrap().new_game()?;
        let player =
            EnginePlayer::new(id, Arc::clone(engine), limit).with_clocks(white_clock, black_clock);
        self.coordinator.add_player(Arc::new(player), color)?;
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for id in self.engine_ids().map(String::from).collect::<Vec<_>>() {
            let _ = self.close_engine(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_label_follows_cursor() {
        let mut session = Session::new();
        assert_eq!(session.prompt_label(), "");
        for (san, label) in [("e4", "1.e4"), ("e5", "1...e5"), ("Nf3", "2.Nf3")] {
            let tree = session.tree_mut();
            let node = tree.add_variation_san(tree.cursor(), san).unwrap();
            tree.set_cursor(node);
            assert_eq!(session.prompt_label(), label);
        }
    }

    #[test]
    fn analysing_engine_cannot_be_seated() {
        let mut session = Session::new();
        session.analysis_mut().start_detached("stockfish", ROOT);
        let err = session
            .add_engine_player("stockfish", Color::White, Limit::default())
            .unwrap_err();
        assert!(err.to_string().contains("analysing"));

        session.analysis_mut().stop("stockfish");
        // Stopped analysis no longer blocks, only the missing engine does.
        let err = session
            .add_engine_player("stockfish", Color::White, Limit::default())
            .unwrap_err();
        assert!(err.to_string().contains("no engine"));
    }

    #[test]
    fn session_from_fen() {
        let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";
        let session = Session::from_fen(fen).unwrap();
        assert_eq!(session.tree().root_fen().as_deref(), Some(fen));
        assert_eq!(session.prompt_label(), "");
        assert!(Session::from_fen("not a fen").is_err());
    }

    #[test]
    fn close_unknown_engine_is_an_error() {
        let mut session = Session::new();
        assert!(session.close_engine("ghost").is_err());
    }

    #[test]
    fn hooks_are_noops_without_match_or_analysis() {
        let mut session = Session::new();
        session.on_before_command();
        let tree = session.tree_mut();
        let node = tree.add_variation_san(ROOT, "d4").unwrap();
        tree.set_cursor(node);
        session.on_after_command();
        assert_eq!(session.prompt_label(), "1.d4");
    }
}
