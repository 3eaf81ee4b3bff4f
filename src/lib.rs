//! Concurrency core of an interactive chess game editor: a branching game
//! tree edited from a single command loop, with engine matches, per-player
//! clocks and background analysis running on worker threads that only ever
//! resolve at command boundaries.

pub mod analysis;
pub mod clock;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod locate;
pub mod movenum;
pub mod pgn;
pub mod player;
pub mod session;
pub mod tree;

pub use analysis::AnalysisManager;
pub use clock::{Clock, WaitOutcome};
pub use coordinator::{MatchCoordinator, MatchEvent, MatchState};
pub use engine::{AnalysisHandle, Engine, EngineBuilder, Limit};
pub use error::{Error, Result};
pub use locate::{FindOpts, find};
pub use movenum::MoveNumber;
pub use pgn::{PgnGame, export};
pub use player::{ClockPlayer, EnginePlayer, PlayResult, Player};
pub use session::Session;
pub use tree::{GameTree, NodeId, ROOT};

#[cfg(test)]
pub(crate) fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if let Ok(logger) = flexi_logger::Logger::try_with_env() {
            let _ = logger.start();
        }
    });
}
