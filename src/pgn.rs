use crate::tree::{GameTree, NodeId, ROOT};
use chrono::Local;
use itertools::Itertools;
use shakmaty::Color;
use std::fmt;

/// A rendered game, headers plus movetext. Writing it out is just Display.
#[derive(Debug, Clone)]
pub struct PgnGame {
    pub headers: Vec<(String, String)>,
    pub movetext: String,
}

impl fmt::Display for PgnGame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.headers {
            writeln!(f, "[{key} {value:?}]")?;
        }
        writeln!(f)?;
        writeln!(f, "{}", self.movetext)
    }
}

/// Render the whole tree, variations included, as a PGN game.
pub fn export(tree: &GameTree) -> PgnGame {
    let mut headers: Vec<(String, String)> = vec![];
    let mut set = |key: &str, value: String| {
        headers.push((key.to_string(), value));
    };

    let result = tree.header("Result").unwrap_or("*").to_string();
    set("Event", header_or(tree, "Event", "?"));
    set("Site", header_or(tree, "Site", "?"));
    set(
        "Date",
        tree.header("Date")
            .map(String::from)
            .unwrap_or_else(|| Local::now().format("%Y.%m.%d").to_string()),
    );
    set("Round", header_or(tree, "Round", "?"));
    set("White", header_or(tree, "White", "?"));
    set("Black", header_or(tree, "Black", "?"));
    set("Result", result.clone());
    if let Some(fen) = tree.root_fen() {
        set("SetUp", "1".to_string());
        set("FEN", fen);
    }
    for (key, value) in tree.headers() {
        if !headers.iter().any(|(k, _)| k == key) {
            headers.push((key.clone(), value.clone()));
        }
    }

    let mut tokens: Vec<String> = vec![];
    if !tree.node(ROOT).comment.is_empty() {
        tokens.push(format!("{{{}}}", tree.node(ROOT).comment));
    }
    render_line(tree, ROOT, true, &mut tokens);
    tokens.push(result);

    PgnGame {
        headers,
        movetext: wrap_tokens(&tokens, 80),
    }
}

fn header_or(tree: &GameTree, key: &str, fallback: &str) -> String {
    tree.header(key).unwrap_or(fallback).to_string()
}

/// Emit the mainline continuation of `node`, with each sibling variation in
/// parentheses right after the mainline move it diverges from.
fn render_line(tree: &GameTree, node: NodeId, mut number_due: bool, tokens: &mut Vec<String>) {
    let mut current = node;
    loop {
        let children = tree.children(current);
        let Some(&main) = children.first() else {
            break;
        };
        render_move(tree, main, number_due, tokens);
        for &variation in &children[1..] {
            tokens.push("(".to_string());
            render_move(tree, variation, true, tokens);
            render_line(tree, variation, annotation_breaks_flow(tree, variation), tokens);
            tokens.push(")".to_string());
        }
        // A comment or a variation interrupts "5.e4 e5"; Black then repeats
        // the number as "5...e5".
        number_due = children.len() > 1 || annotation_breaks_flow(tree, main);
        current = main;
    }
}

fn render_move(tree: &GameTree, node: NodeId, number_due: bool, tokens: &mut Vec<String>) {
    let Some(san) = tree.san(node) else {
        return;
    };
    let number = tree.move_number(node);
    match number {
        Some(n) if n.color == Color::White || number_due => {
            tokens.push(format!("{n}{san}"));
        }
        _ => tokens.push(san.to_string()),
    }
    let data = tree.node(node);
    for nag in &data.nags {
        tokens.push(format!("${nag}"));
    }
    if let Some(comment) = annotation_comment(tree, node) {
        tokens.push(format!("{{{comment}}}"));
    }
}

/// The brace comment for a node: embedded annotation commands first, then
/// the free text.
fn annotation_comment(tree: &GameTree, node: NodeId) -> Option<String> {
    let data = tree.node(node);
    let mut parts: Vec<String> = vec![];
    if let Some(seconds) = data.clock_seconds {
        let total = seconds.max(0.0) as u64;
        parts.push(format!(
            "[%clk {}:{:02}:{:02}]",
            total / 3600,
            total / 60 % 60,
            total % 60
        ));
    }
    if let Some(eval) = data.eval {
        parts.push(format!("[%eval {eval:.2}]"));
    }
    if !data.arrows.is_empty() {
        let arrows = data.arrows.iter().map(|(a, b)| format!("G{a}{b}")).join(",");
        parts.push(format!("[%cal {arrows}]"));
    }
    if !data.comment.is_empty() {
        parts.push(data.comment.clone());
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

fn annotation_breaks_flow(tree: &GameTree, node: NodeId) -> bool {
    annotation_comment(tree, node).is_some() || !tree.node(node).nags.is_empty()
}

fn wrap_tokens(tokens: &[String], width: usize) -> String {
    let mut out = String::new();
    let mut line_len = 0;
    for token in tokens {
        if line_len == 0 {
            out.push_str(token);
            line_len = token.len();
        } else if line_len + 1 + token.len() > width {
            out.push('\n');
            out.push_str(token);
            line_len = token.len();
        } else {
            out.push(' ');
            out.push_str(token);
            line_len += 1 + token.len();
        }
    }
    out
}
