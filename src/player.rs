use crate::clock::{Clock, WaitOutcome};
use crate::engine::{Engine, GoClocks, Limit, PlayOutcome};
use crate::error::{Error, Result};
use crate::tree::{GameTree, NodeId};
use crossbeam_channel::Receiver;
use log::info;
use shakmaty::uci::UciMove;
use shakmaty::{Chess, Color, Move, Position};
use std::sync::{Arc, Mutex};

/// What a player resolved to when asked to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayResult {
    Move(Move),
    Resigned,
    Timeout,
}

/// Everything a player needs to think about one position, captured from the
/// tree before the thinking task is spawned so the task never touches the
/// tree itself.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub position: Chess,
    pub root_fen: Option<String>,
    pub moves: Vec<String>,
}

impl PlayRequest {
    pub fn at(tree: &GameTree, node: NodeId) -> PlayRequest {
        PlayRequest {
            position: tree.position(node).clone(),
            root_fen: tree.root_fen(),
            moves: tree.uci_path(node),
        }
    }

    pub fn turn(&self) -> Color {
        self.position.turn()
    }
}

/// A player-ish: a chess engine, or a clock which never makes a move but
/// signals timeout.
///
/// `play` may block for a long time and must honor `cancel`: once cancelled
/// it releases its resources (e.g. stops an in-flight search) and resolves
/// to `Ok(None)`, never to a result.
pub trait Player: Send + Sync {
    /// A short name for the player.
    fn name(&self) -> String;

    /// Ask the player to move in the position of `req`.
    fn play(&self, req: &PlayRequest, cancel: &Receiver<()>) -> Result<Option<PlayResult>>;

    /// Called once per completed move for time-control bookkeeping.
    fn next_move(&self) {}

    /// The clock driving this player, if it is a clock-timeout player.
    fn clock(&self) -> Option<&Clock> {
        None
    }
}

/// An engine-backed player with fixed per-move limits, aware of both sides'
/// clocks when a timed match is running.
pub struct EnginePlayer {
    name: String,
    engine: Arc<Mutex<Engine>>,
    limit: Limit,
    white_clock: Option<Clock>,
    black_clock: Option<Clock>,
}

impl EnginePlayer {
    pub fn new(name: &str, engine: Arc<Mutex<Engine>>, limit: Limit) -> EnginePlayer {
        EnginePlayer {
            name: name.to_string(),
            engine,
            limit,
            white_clock: None,
            black_clock: None,
        }
    }

    pub fn with_clocks(
        mut self,
        white: Option<Clock>,
        black: Option<Clock>,
    ) -> EnginePlayer {
        self.white_clock = white;
        self.black_clock = black;
        self
    }

    /// The limit for the next move: fixed settings plus the live clock
    /// state of both sides when either clock exists.
    fn current_limit(&self) -> Limit {
        clocked_limit(
            &self.limit,
            self.white_clock.as_ref(),
            self.black_clock.as_ref(),
        )
    }
}

/// Fold the live remaining times and increments of both sides into a fixed
/// per-move limit.
fn clocked_limit(base: &Limit, white: Option<&Clock>, black: Option<&Clock>) -> Limit {
    let mut limit = base.clone();
    if white.is_some() || black.is_some() {
        let mut clocks = GoClocks::default();
        if let Some(clock) = white {
            clocks.wtime = clock.remaining();
            clocks.winc = clock.increment();
        }
        if let Some(clock) = black {
            clocks.btime = clock.remaining();
            clocks.binc = clock.increment();
        }
        limit.clocks = Some(clocks);
    }
    limit
}

impl Player for EnginePlayer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn play(&self, req: &PlayRequest, cancel: &Receiver<()>) -> Result<Option<PlayResult>> {
        let limit = self.current_limit();
        let engine = self.engine.lock().unwrap();
        let outcome = engine.play(req.root_fen.as_deref(), &req.moves, &limit, cancel)?;
        match outcome {
            None => Ok(None),
            Some(PlayOutcome::Resigned) => {
                info!("{} resigned", self.name);
                Ok(Some(PlayResult::Resigned))
            }
            Some(PlayOutcome::Move(record)) => {
                let uci: UciMove = record
                    .uci
                    .parse()
                    .map_err(|_| Error::player(&self.name, format!("bad move: {}", record.uci)))?;
                let mv = uci.to_move(&req.position).map_err(|_| {
                    Error::player(&self.name, format!("illegal move: {}", record.uci))
                })?;
                Ok(Some(PlayResult::Move(mv)))
            }
        }
    }
}

/// A clock as a player: it never moves, it only resolves to `Timeout` when
/// its side runs out of time. It races against the real movers of the same
/// color.
pub struct ClockPlayer {
    name: String,
    clock: Clock,
}

impl ClockPlayer {
    pub fn new(name: &str, clock: Clock) -> ClockPlayer {
        ClockPlayer {
            name: name.to_string(),
            clock,
        }
    }
}

impl Player for ClockPlayer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn play(&self, _req: &PlayRequest, cancel: &Receiver<()>) -> Result<Option<PlayResult>> {
        match self.clock.wait_for_timeout(cancel) {
            WaitOutcome::Fired => Ok(Some(PlayResult::Timeout)),
            WaitOutcome::Cancelled => Ok(None),
        }
    }

    fn next_move(&self) {
        self.clock.apply_increment();
    }

    fn clock(&self) -> Option<&Clock> {
        Some(&self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn play_request_captures_path() {
        let mut tree = GameTree::new();
        for san in ["d4", "d5", "c4"] {
            let node = tree.add_variation_san(tree.cursor(), san).unwrap();
            tree.set_cursor(node);
        }
        let req = PlayRequest::at(&tree, tree.cursor());
        assert_eq!(req.moves, vec!["d2d4", "d7d5", "c2c4"]);
        assert_eq!(req.root_fen, None);
        assert_eq!(req.turn(), Color::Black);
    }

    #[test]
    fn clock_player_times_out() {
        let clock = Clock::new(Duration::from_millis(20), Duration::ZERO);
        clock.start();
        let player = ClockPlayer::new("Black clock", clock);
        let (_cancel_tx, cancel_rx) = bounded::<()>(0);
        let req = PlayRequest::at(&GameTree::new(), crate::tree::ROOT);
        let result = player.play(&req, &cancel_rx).unwrap();
        assert_eq!(result, Some(PlayResult::Timeout));
    }

    #[test]
    fn clock_player_cancelled_produces_nothing() {
        let clock = Clock::new(Duration::from_secs(300), Duration::ZERO);
        clock.start();
        let player = Arc::new(ClockPlayer::new("White clock", clock));
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let worker = {
            let player = Arc::clone(&player);
            thread::spawn(move || {
                let req = PlayRequest::at(&GameTree::new(), crate::tree::ROOT);
                player.play(&req, &cancel_rx)
            })
        };
        thread::sleep(Duration::from_millis(10));
        drop(cancel_tx);
        assert_eq!(worker.join().unwrap().unwrap(), None);
    }

    #[test]
    fn limit_folds_live_clocks() {
        let white = Clock::new(Duration::from_secs(60), Duration::from_secs(1));
        let black = Clock::new(Duration::from_secs(45), Duration::from_secs(2));
        let limit = clocked_limit(&Limit::default(), Some(&white), Some(&black));
        let clocks = limit.clocks.expect("clocks should be folded in");
        assert_eq!(clocks.wtime, Duration::from_secs(60));
        assert_eq!(clocks.winc, Duration::from_secs(1));
        assert_eq!(clocks.btime, Duration::from_secs(45));
        assert_eq!(clocks.binc, Duration::from_secs(2));

        // A missing side leaves its fields zeroed; no clocks at all leaves
        // the fixed limit untouched.
        let limit = clocked_limit(&Limit::default(), None, Some(&black));
        assert_eq!(limit.clocks.unwrap().wtime, Duration::ZERO);
        assert!(clocked_limit(&Limit::default(), None, None).clocks.is_none());
    }

    #[test]
    fn next_move_applies_increment() {
        let clock = Clock::new(Duration::from_secs(60), Duration::from_secs(5));
        let player = ClockPlayer::new("clock", clock.clone());
        player.next_move();
        assert_eq!(clock.remaining(), Duration::from_secs(65));
    }
}
