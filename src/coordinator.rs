use crate::error::Result;
use crate::player::{PlayRequest, PlayResult, Player};
use crate::tree::{GameTree, NodeId, describe_outcome, result_string};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{info, warn};
use shakmaty::{Color, Position};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type PlayerId = usize;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MatchState {
    NotStarted,
    Ongoing,
    Paused,
    Finished,
}

/// Something that happened since the last `take_events` call, for the
/// command loop to report to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    MovePlayed { player: String, san: String },
    Knockout { player: String, reason: String },
    Finished { result: String, message: String },
}

struct Seat {
    player: Arc<dyn Player>,
    color: Color,
}

// A spawned thinking task. Dropping `cancel` cancels the task; the
// coordinator then joins the handle so cancellation is synchronous.
struct ThinkTask {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

type Resolution = (PlayerId, Result<Option<PlayResult>>);

/// Drives a match of registered players over the shared game tree.
///
/// All tree access happens on the command loop: `start`/`sync`/`pause` run
/// there, thinking tasks only ever see a position snapshot and resolve over
/// the results channel. The anchor is the node the current ply is being
/// played from; the match follows the cursor exactly one ply at a time.
pub struct MatchCoordinator {
    state: MatchState,
    seats: BTreeMap<PlayerId, Seat>,
    tasks: BTreeMap<PlayerId, ThinkTask>,
    next_id: PlayerId,
    anchor: NodeId,
    results_tx: Sender<Resolution>,
    results_rx: Receiver<Resolution>,
    events: Vec<MatchEvent>,
    result: Option<String>,
}

impl MatchCoordinator {
    pub fn new() -> MatchCoordinator {
        let (results_tx, results_rx) = unbounded();
        MatchCoordinator {
            state: MatchState::NotStarted,
            seats: BTreeMap::new(),
            tasks: BTreeMap::new(),
            next_id: 0,
            anchor: 0,
            results_tx,
            results_rx,
            events: vec![],
            result: None,
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn players(&self) -> Vec<(PlayerId, String, Color)> {
        self.seats
            .iter()
            .map(|(&id, seat)| (id, seat.player.name(), seat.color))
            .collect()
    }

    pub fn take_events(&mut self) -> Vec<MatchEvent> {
        std::mem::take(&mut self.events)
    }

    /// Register a player for one color. Only possible before the match starts.
    pub fn add_player(&mut self, player: Arc<dyn Player>, color: Color) -> Result<PlayerId> {
        if self.state != MatchState::NotStarted {
            return Err(crate::error::Error::command(
                "players can only be added before the match starts",
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.seats.insert(id, Seat { player, color });
        Ok(id)
    }

    /// Start the match from the current cursor position.
    pub fn start(&mut self, tree: &mut GameTree) -> Result<()> {
        if self.state != MatchState::NotStarted {
            return Err(crate::error::Error::command("the match has already started"));
        }
        self.anchor = tree.cursor();
        self.state = MatchState::Ongoing;
        info!("match started at node {}", self.anchor);
        self.start_clocks(tree.position(self.anchor).turn());
        self.begin_thinking(tree);
        Ok(())
    }

    /// Catch up with everything that resolved since the last call, then
    /// follow the cursor to the next ply if it advanced. Idempotent while
    /// nothing happened; called from the session hooks around every command.
    pub fn sync(&mut self, tree: &mut GameTree) {
        while let Ok((id, result)) = self.results_rx.try_recv() {
            if self.state != MatchState::Ongoing || tree.cursor() != self.anchor {
                // Stale: another resolution or the user already moved on.
                break;
            }
            self.handle_resolution(tree, id, result);
        }

        if self.state != MatchState::Ongoing || tree.cursor() == self.anchor {
            return;
        }
        // The match only ever follows the cursor one ply past the anchor;
        // navigating anywhere else leaves the thinking tasks in place.
        if tree.parent(tree.cursor()) != Some(self.anchor) {
            return;
        }
        let mover = tree.position(self.anchor).turn();
        self.cancel_tasks();
        for seat in self.seats.values() {
            if seat.color == mover {
                seat.player.next_move();
            }
        }
        self.stop_clocks(mover);
        self.anchor = tree.cursor();
        self.start_clocks(tree.position(self.anchor).turn());
        self.begin_thinking(tree);
    }

    /// Suspend the match: cancel all thinking and stop all clocks, keeping
    /// the anchor where it is.
    pub fn pause(&mut self) {
        if self.state != MatchState::Ongoing {
            return;
        }
        self.cancel_tasks();
        for seat in self.seats.values() {
            if let Some(clock) = seat.player.clock() {
                clock.stop();
            }
        }
        self.state = MatchState::Paused;
        info!("match paused");
    }

    pub fn resume(&mut self, tree: &mut GameTree) {
        if self.state != MatchState::Paused {
            return;
        }
        self.state = MatchState::Ongoing;
        info!("match resumed");
        self.start_clocks(tree.position(self.anchor).turn());
        self.begin_thinking(tree);
    }

    /// Terminal check, exhausted-clock check, then one task per player of
    /// the side to move.
    fn begin_thinking(&mut self, tree: &mut GameTree) {
        if let Some(outcome) = tree.outcome(self.anchor) {
            let message = describe_outcome(tree.position(self.anchor), &outcome);
            self.finish(tree, result_string(&outcome), &message);
            return;
        }
        let to_move = tree.position(self.anchor).turn();
        // A clock that is already out of time, on either side, resolves the
        // match without asking anyone to think.
        let exhausted = self.seats.iter().find_map(|(_, seat)| {
            seat.player
                .clock()
                .is_some_and(|clock| clock.remaining().is_zero())
                .then_some(seat.color)
        });
        if let Some(loser) = exhausted {
            let message = format!(
                "{} lost on time: {}",
                color_name(loser),
                loss_result(loser)
            );
            self.finish(tree, loss_result(loser), &message);
            return;
        }
        for id in self.seat_ids(to_move) {
            self.spawn_task(tree, id);
        }
    }

    fn spawn_task(&mut self, tree: &GameTree, id: PlayerId) {
        let player = Arc::clone(&self.seats[&id].player);
        let req = PlayRequest::at(tree, self.anchor);
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let results_tx = self.results_tx.clone();
        let handle = thread::spawn(move || {
            let result = player.play(&req, &cancel_rx);
            let _ = results_tx.send((id, result));
        });
        self.tasks.insert(
            id,
            ThinkTask {
                cancel: cancel_tx,
                handle,
            },
        );
    }

    fn handle_resolution(
        &mut self,
        tree: &mut GameTree,
        id: PlayerId,
        result: Result<Option<PlayResult>>,
    ) {
        if let Some(task) = self.tasks.remove(&id) {
            drop(task.cancel);
            let _ = task.handle.join();
        }
        let Some(seat) = self.seats.get(&id) else {
            return;
        };
        let name = seat.player.name();
        let color = seat.color;
        match result {
            Ok(None) => {}
            Ok(Some(PlayResult::Move(mv))) => match tree.add_variation(self.anchor, mv) {
                Ok(node) => {
                    // The advance branch of sync() picks the cursor move up,
                    // including a terminal position check at the new anchor.
                    tree.set_cursor(node);
                    let san = tree.san(node).unwrap_or_default().to_string();
                    info!("{name} played {san}");
                    self.events.push(MatchEvent::MovePlayed { player: name, san });
                }
                Err(e) => self.knockout(id, &e.to_string()),
            },
            Ok(Some(PlayResult::Resigned)) => {
                let message = format!("{} resigned: {}", color_name(color), loss_result(color));
                self.finish(tree, loss_result(color), &message);
            }
            Ok(Some(PlayResult::Timeout)) => {
                let message = format!("{} lost on time: {}", color_name(color), loss_result(color));
                self.finish(tree, loss_result(color), &message);
            }
            Err(e) => self.knockout(id, &e.to_string()),
        }
    }

    /// Remove a misbehaving player from the match. The tree is untouched and
    /// the match stays ongoing for everyone else.
    fn knockout(&mut self, id: PlayerId, reason: &str) {
        if let Some(seat) = self.seats.remove(&id) {
            let name = seat.player.name();
            warn!("{name} knocked out: {reason}");
            self.events.push(MatchEvent::Knockout {
                player: name,
                reason: reason.to_string(),
            });
        }
        if let Some(task) = self.tasks.remove(&id) {
            drop(task.cancel);
            let _ = task.handle.join();
        }
    }

    fn finish(&mut self, tree: &mut GameTree, result: &str, message: &str) {
        self.cancel_tasks();
        for seat in self.seats.values() {
            if let Some(clock) = seat.player.clock() {
                clock.stop();
            }
        }
        self.state = MatchState::Finished;
        self.result = Some(result.to_string());
        tree.append_comment(tree.cursor(), message);
        if tree.is_mainline(tree.cursor()) {
            tree.set_header("Result", result);
        }
        info!("match finished: {message}");
        self.events.push(MatchEvent::Finished {
            result: result.to_string(),
            message: message.to_string(),
        });
    }

    /// Cancel every outstanding task and wait for it to exit, then discard
    /// whatever stale resolutions were already in flight.
    fn cancel_tasks(&mut self) {
        for (_, task) in std::mem::take(&mut self.tasks) {
            drop(task.cancel);
            let _ = task.handle.join();
        }
        while self.results_rx.try_recv().is_ok() {}
    }

    fn seat_ids(&self, color: Color) -> Vec<PlayerId> {
        self.seats
            .iter()
            .filter(|(_, seat)| seat.color == color)
            .map(|(&id, _)| id)
            .collect()
    }

    fn start_clocks(&self, color: Color) {
        for seat in self.seats.values() {
            if seat.color == color {
                if let Some(clock) = seat.player.clock() {
                    clock.start();
                }
            }
        }
    }

    fn stop_clocks(&self, color: Color) {
        for seat in self.seats.values() {
            if seat.color == color {
                if let Some(clock) = seat.player.clock() {
                    clock.stop();
                }
            }
        }
    }
}

impl Default for MatchCoordinator {
    fn default() -> Self {
        MatchCoordinator::new()
    }
}

impl Drop for MatchCoordinator {
    fn drop(&mut self) {
        self.cancel_tasks();
    }
}

fn loss_result(loser: Color) -> &'static str {
    match loser {
        Color::White => "0-1",
        Color::Black => "1-0",
    }
}

fn color_name(color: Color) -> &'static str {
    match color {
        Color::White => "White",
        Color::Black => "Black",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::player::ClockPlayer;
    use crate::tree::parse_san;
    use shakmaty::{Move, Role, Square};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Action {
        San(&'static str),
        Raw(Move),
        Resign,
        Fail(&'static str),
        // Block until cancelled.
        Wait,
    }

    /// A player driven by a fixed script, one action per play() call. An
    /// exhausted script blocks like Wait.
    struct Scripted {
        name: String,
        script: Mutex<VecDeque<Action>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &str, script: Vec<Action>) -> Arc<Scripted> {
            crate::init_test_logging();
            Arc::new(Scripted {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Player for Scripted {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn play(&self, req: &PlayRequest, cancel: &Receiver<()>) -> Result<Option<PlayResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let action = self.script.lock().unwrap().pop_front();
            match action {
                Some(Action::San(san)) => {
                    Ok(Some(PlayResult::Move(parse_san(&req.position, san)?)))
                }
                Some(Action::Raw(mv)) => Ok(Some(PlayResult::Move(mv))),
                Some(Action::Resign) => Ok(Some(PlayResult::Resigned)),
                Some(Action::Fail(reason)) => Err(crate::error::Error::player(&self.name, reason)),
                Some(Action::Wait) | None => {
                    let _ = cancel.recv();
                    Ok(None)
                }
            }
        }
    }

    fn settle(coordinator: &mut MatchCoordinator, tree: &mut GameTree) {
        std::thread::sleep(Duration::from_millis(30));
        coordinator.sync(tree);
    }

    #[test]
    fn scripted_move_advances_cursor() {
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        let white = Scripted::new("white", vec![Action::San("e4")]);
        coordinator.add_player(white, Color::White).unwrap();
        coordinator.start(&mut tree).unwrap();
        settle(&mut coordinator, &mut tree);
        assert_eq!(tree.san(tree.cursor()), Some("e4"));
        assert_eq!(coordinator.state(), MatchState::Ongoing);
        let events = coordinator.take_events();
        assert_eq!(
            events,
            vec![MatchEvent::MovePlayed {
                player: "white".into(),
                san: "e4".into()
            }]
        );
        // Nothing more resolves; sync is idempotent.
        coordinator.sync(&mut tree);
        assert_eq!(tree.san(tree.cursor()), Some("e4"));
    }

    #[test]
    fn exhausted_clock_resolves_without_thinking() {
        let mut tree = GameTree::new();
        let e4 = tree.add_variation_san(0, "e4").unwrap();
        tree.set_cursor(e4);

        let mut coordinator = MatchCoordinator::new();
        let engine = Scripted::new("black engine", vec![Action::San("e5")]);
        coordinator.add_player(engine.clone(), Color::Black).unwrap();
        let clock = Clock::new(Duration::ZERO, Duration::ZERO);
        coordinator
            .add_player(Arc::new(ClockPlayer::new("black clock", clock)), Color::Black)
            .unwrap();

        coordinator.start(&mut tree).unwrap();
        // Black's clock was already empty: the match resolves in start(),
        // the engine is never consulted, the tree gains no move.
        assert_eq!(coordinator.state(), MatchState::Finished);
        assert_eq!(coordinator.result(), Some("1-0"));
        assert_eq!(engine.calls(), 0);
        assert_eq!(tree.cursor(), e4);
        assert!(tree.node(e4).comment.contains("lost on time"));
        assert_eq!(tree.header("Result"), Some("1-0"));
    }

    #[test]
    fn exhausted_opponent_clock_is_noticed() {
        // White to move, but it is Black's stopped clock that is empty.
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        let engine = Scripted::new("white engine", vec![Action::San("e4")]);
        coordinator.add_player(engine.clone(), Color::White).unwrap();
        let clock = Clock::new(Duration::from_secs(60), Duration::ZERO);
        clock.set(Duration::ZERO);
        coordinator
            .add_player(Arc::new(ClockPlayer::new("black clock", clock)), Color::Black)
            .unwrap();
        coordinator.start(&mut tree).unwrap();
        assert_eq!(coordinator.state(), MatchState::Finished);
        assert_eq!(coordinator.result(), Some("1-0"));
        assert_eq!(engine.calls(), 0);
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn illegal_move_is_a_knockout() {
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        let illegal = Move::Normal {
            role: Role::King,
            from: Square::E1,
            capture: None,
            to: Square::E5,
            promotion: None,
        };
        let white = Scripted::new("broken", vec![Action::Raw(illegal)]);
        coordinator.add_player(white, Color::White).unwrap();
        coordinator.start(&mut tree).unwrap();
        settle(&mut coordinator, &mut tree);

        // The tree is untouched and the match keeps going without the player.
        assert_eq!(tree.cursor(), 0);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(coordinator.state(), MatchState::Ongoing);
        assert!(coordinator.players().is_empty());
        match coordinator.take_events().as_slice() {
            [MatchEvent::Knockout { player, .. }] => assert_eq!(player, "broken"),
            events => panic!("unexpected events: {events:?}"),
        }
    }

    #[test]
    fn failing_player_is_a_knockout() {
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        let white = Scripted::new("crasher", vec![Action::Fail("lost pipe")]);
        coordinator.add_player(white, Color::White).unwrap();
        coordinator.start(&mut tree).unwrap();
        settle(&mut coordinator, &mut tree);
        assert_eq!(coordinator.state(), MatchState::Ongoing);
        match coordinator.take_events().as_slice() {
            [MatchEvent::Knockout { reason, .. }] => assert!(reason.contains("lost pipe")),
            events => panic!("unexpected events: {events:?}"),
        }
    }

    #[test]
    fn resignation_finishes_the_match() {
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        let white = Scripted::new("white", vec![Action::Resign]);
        coordinator.add_player(white, Color::White).unwrap();
        coordinator.start(&mut tree).unwrap();
        settle(&mut coordinator, &mut tree);
        assert_eq!(coordinator.state(), MatchState::Finished);
        assert_eq!(coordinator.result(), Some("0-1"));
        assert!(tree.node(tree.cursor()).comment.contains("White resigned"));
    }

    #[test]
    fn checkmate_finishes_the_match() {
        let mut tree = GameTree::new();
        for san in ["f3", "e5", "g4"] {
            let node = tree.add_variation_san(tree.cursor(), san).unwrap();
            tree.set_cursor(node);
        }
        let mut coordinator = MatchCoordinator::new();
        let black = Scripted::new("black", vec![Action::San("Qh4#")]);
        coordinator.add_player(black, Color::Black).unwrap();
        coordinator.start(&mut tree).unwrap();
        settle(&mut coordinator, &mut tree);
        assert_eq!(coordinator.state(), MatchState::Finished);
        assert_eq!(coordinator.result(), Some("0-1"));
        assert!(tree.node(tree.cursor()).comment.contains("checkmate"));
    }

    #[test]
    fn pause_cancels_and_resume_rethinks() {
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        let white = Scripted::new("white", vec![Action::Wait, Action::San("d4")]);
        coordinator.add_player(white.clone(), Color::White).unwrap();
        coordinator.start(&mut tree).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        // pause() joins the task, so the cancelled first call is complete
        // here and produced nothing.
        coordinator.pause();
        assert_eq!(coordinator.state(), MatchState::Paused);
        assert_eq!(white.calls(), 1);
        coordinator.sync(&mut tree);
        assert_eq!(tree.cursor(), 0);

        coordinator.resume(&mut tree);
        settle(&mut coordinator, &mut tree);
        assert_eq!(tree.san(tree.cursor()), Some("d4"));
        assert_eq!(white.calls(), 2);
    }

    #[test]
    fn human_move_recycles_thinking() {
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        // Black is an engine; White is a human typing moves at the prompt.
        let black = Scripted::new("black", vec![Action::San("e5")]);
        coordinator.add_player(black.clone(), Color::Black).unwrap();
        coordinator.start(&mut tree).unwrap();
        assert_eq!(black.calls(), 0);

        let e4 = tree.add_variation_san(tree.cursor(), "e4").unwrap();
        tree.set_cursor(e4);
        coordinator.sync(&mut tree);
        settle(&mut coordinator, &mut tree);
        assert_eq!(tree.san(tree.cursor()), Some("e5"));
        assert_eq!(tree.parent(tree.cursor()), Some(e4));
    }

    #[test]
    fn clock_timeout_beats_a_stalled_engine() {
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        let engine = Scripted::new("white engine", vec![Action::Wait]);
        coordinator.add_player(engine, Color::White).unwrap();
        let clock = Clock::new(Duration::from_millis(15), Duration::ZERO);
        coordinator
            .add_player(
                Arc::new(ClockPlayer::new("white clock", clock)),
                Color::White,
            )
            .unwrap();
        coordinator.start(&mut tree).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        coordinator.sync(&mut tree);
        assert_eq!(coordinator.state(), MatchState::Finished);
        assert_eq!(coordinator.result(), Some("0-1"));
        assert!(tree.node(tree.cursor()).comment.contains("lost on time"));
    }

    #[test]
    fn players_only_before_start() {
        let mut tree = GameTree::new();
        let mut coordinator = MatchCoordinator::new();
        coordinator.start(&mut tree).unwrap();
        let late = Scripted::new("late", vec![]);
        assert!(coordinator.add_player(late, Color::White).is_err());
    }
}
