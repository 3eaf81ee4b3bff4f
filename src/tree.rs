use crate::error::{Error, Result};
use crate::movenum::MoveNumber;
use shakmaty::fen::Fen;
use shakmaty::san::{San, SanPlus};
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, Outcome, Position, Square};

pub type NodeId = usize;

/// One position in the branching game history.
///
/// The position itself is a pure function of the root plus the path of moves
/// leading here; it is cached on the node so it is computed exactly once.
/// Annotations are mutable payload and carry no concurrency meaning.
#[derive(Debug, Clone)]
pub struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    mv: Option<Move>,
    san: Option<String>,
    position: Chess,
    pub comment: String,
    pub nags: Vec<u16>,
    pub eval: Option<f64>,
    pub clock_seconds: Option<f64>,
    pub arrows: Vec<(Square, Square)>,
}

impl Node {
    fn root(position: Chess) -> Node {
        Node {
            parent: None,
            children: vec![],
            mv: None,
            san: None,
            position,
            comment: String::new(),
            nags: vec![],
            eval: None,
            clock_seconds: None,
            arrows: vec![],
        }
    }
}

/// The branching move tree with a single cursor marking the current position.
///
/// All reads and mutations happen on the command loop between suspension
/// points; the tree itself is plain single-threaded data.
#[derive(Debug, Clone)]
pub struct GameTree {
    nodes: Vec<Node>,
    cursor: NodeId,
    headers: Vec<(String, String)>,
}

pub const ROOT: NodeId = 0;

impl GameTree {
    pub fn new() -> GameTree {
        GameTree {
            nodes: vec![Node::root(Chess::default())],
            cursor: ROOT,
            headers: vec![],
        }
    }

    pub fn from_fen(fen: &str) -> Result<GameTree> {
        let fen: Fen = fen
            .parse()
            .map_err(|e| Error::Config(format!("invalid FEN: {e}")))?;
        let position: Chess = fen
            .into_position(CastlingMode::Standard)
            .map_err(|e| Error::Config(format!("invalid FEN position: {e}")))?;
        Ok(GameTree {
            nodes: vec![Node::root(position)],
            cursor: ROOT,
            headers: vec![],
        })
    }

    pub fn cursor(&self) -> NodeId {
        self.cursor
    }

    pub fn set_cursor(&mut self, node: NodeId) {
        assert!(node < self.nodes.len());
        self.cursor = node;
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn position(&self, id: NodeId) -> &Chess {
        &self.nodes[id].position
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// The mainline continuation, if any.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].children.first().copied()
    }

    pub fn node_move(&self, id: NodeId) -> Option<&Move> {
        self.nodes[id].mv.as_ref()
    }

    pub fn san(&self, id: NodeId) -> Option<&str> {
        self.nodes[id].san.as_deref()
    }

    /// The move number of the move that produced this node. None at the root.
    pub fn move_number(&self, id: NodeId) -> Option<MoveNumber> {
        self.nodes[id]
            .mv
            .as_ref()
            .map(|_| MoveNumber::from_position(&self.nodes[id].position))
    }

    /// True iff the node is the first variation of its parent.
    pub fn is_first_variation(&self, id: NodeId) -> bool {
        match self.nodes[id].parent {
            Some(parent) => self.nodes[parent].children.first() == Some(&id),
            None => true,
        }
    }

    /// True iff the whole path from the root to this node follows first
    /// variations only.
    pub fn is_mainline(&self, id: NodeId) -> bool {
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            if self.nodes[parent].children.first() != Some(&cur) {
                return false;
            }
            cur = parent;
        }
        true
    }

    /// All other variations under the same parent.
    pub fn siblings(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes[id].parent {
            Some(parent) => self.nodes[parent]
                .children
                .iter()
                .copied()
                .filter(|&c| c != id)
                .collect(),
            None => vec![],
        }
    }

    /// Node ids on the path from the first move down to `id` (excluding the root).
    pub fn path_from_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![];
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            path.push(cur);
            cur = parent;
        }
        path.reverse();
        path
    }

    /// UCI strings for the moves from the root down to `id`.
    pub fn uci_path(&self, id: NodeId) -> Vec<String> {
        self.path_from_root(id)
            .iter()
            .map(|&n| {
                self.nodes[n]
                    .mv
                    .as_ref()
                    .map(|m| m.to_uci(CastlingMode::Standard).to_string())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// FEN of the root position, or None for the standard starting position.
    pub fn root_fen(&self) -> Option<String> {
        if self.nodes[ROOT].position == Chess::default() {
            None
        } else {
            Some(
                Fen::from_position(self.nodes[ROOT].position.clone(), EnPassantMode::Legal)
                    .to_string(),
            )
        }
    }

    /// Add `mv` as a new variation under `parent`. If the move already exists
    /// as a child the existing node is returned instead.
    pub fn add_variation(&mut self, parent: NodeId, mv: Move) -> Result<NodeId> {
        if let Some(&existing) = self.nodes[parent]
            .children
            .iter()
            .find(|&&c| self.nodes[c].mv.as_ref() == Some(&mv))
        {
            return Ok(existing);
        }
        let parent_pos = &self.nodes[parent].position;
        if !parent_pos.is_legal(&mv) {
            return Err(Error::command(format!("illegal move: {mv:?}")));
        }
        let san = san_string(parent_pos, &mv);
        let position = parent_pos
            .clone()
            .play(&mv)
            .map_err(|e| Error::command(format!("illegal move: {e}")))?;
        let id = self.nodes.len();
        let mut node = Node::root(position);
        node.parent = Some(parent);
        node.mv = Some(mv);
        node.san = Some(san);
        self.nodes.push(node);
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Parse a SAN move in the position at `parent` and add it as a variation.
    pub fn add_variation_san(&mut self, parent: NodeId, san: &str) -> Result<NodeId> {
        let mv = parse_san(&self.nodes[parent].position, san)?;
        self.add_variation(parent, mv)
    }

    /// Make `id` the first variation of its parent.
    pub fn promote(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent {
            let children = &mut self.nodes[parent].children;
            if let Some(idx) = children.iter().position(|&c| c == id) {
                children.remove(idx);
                children.insert(0, id);
            }
        }
    }

    /// Make the whole path from the root to `id` the main line.
    pub fn promote_to_mainline(&mut self, id: NodeId) {
        let mut cur = id;
        loop {
            self.promote(cur);
            match self.nodes[cur].parent {
                Some(parent) => cur = parent,
                None => break,
            }
        }
    }

    /// Terminal outcome of the position at `id`, if any.
    pub fn outcome(&self, id: NodeId) -> Option<Outcome> {
        self.nodes[id].position.outcome()
    }

    /// Append `text` to the node comment unless it is already present.
    pub fn append_comment(&mut self, id: NodeId, text: &str) {
        let comment = &mut self.nodes[id].comment;
        if comment.contains(text) {
            return;
        }
        if comment.is_empty() {
            *comment = text.to_string();
        } else {
            *comment = format!("{comment} {text}");
        }
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        match self.headers.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((key.to_string(), value.to_string())),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for GameTree {
    fn default() -> Self {
        GameTree::new()
    }
}

/// SAN with check/mate suffix for a legal move in `pos`.
pub fn san_string(pos: &Chess, mv: &Move) -> String {
    let san = San::from_move(pos, mv).to_string();
    match pos.clone().play(mv) {
        Ok(after) if after.is_checkmate() => format!("{san}#"),
        Ok(after) if after.is_check() => format!("{san}+"),
        _ => san,
    }
}

/// Parse a SAN (optionally suffixed) or UCI move string against `pos`.
pub fn parse_san(pos: &Chess, text: &str) -> Result<Move> {
    if let Ok(san) = text.parse::<SanPlus>() {
        if let Ok(mv) = san.san.to_move(pos) {
            return Ok(mv);
        }
    }
    if let Ok(uci) = text.parse::<UciMove>() {
        if let Ok(mv) = uci.to_move(pos) {
            return Ok(mv);
        }
    }
    Err(Error::command(format!("invalid or illegal move: {text}")))
}

/// "1-0", "0-1" or "1/2-1/2".
pub fn result_string(outcome: &Outcome) -> &'static str {
    match outcome.winner() {
        Some(Color::White) => "1-0",
        Some(Color::Black) => "0-1",
        None => "1/2-1/2",
    }
}

/// Human readable description of a terminal position.
pub fn describe_outcome(pos: &Chess, outcome: &Outcome) -> String {
    let result = result_string(outcome);
    if pos.is_checkmate() {
        let winner = match pos.turn() {
            Color::White => "Black",
            Color::Black => "White",
        };
        format!("{winner} won by checkmate: {result}")
    } else if pos.is_stalemate() {
        format!("Draw by stalemate: {result}")
    } else if pos.is_insufficient_material() {
        format!("Draw by insufficient material: {result}")
    } else {
        format!("Game over: {result}")
    }
}
