use crate::movenum::MoveNumber;
use crate::tree::{GameTree, NodeId, ROOT, parse_san};
use std::collections::VecDeque;

pub type StopPredicate<'a> = &'a dyn Fn(&GameTree, NodeId) -> bool;

/// Search controls for [`find`].
#[derive(Default)]
pub struct FindOpts<'a> {
    /// Also consider sibling variations of the start node.
    pub search_sidelines: bool,
    /// Expand into children of sideline nodes as well.
    pub recurse_sidelines: bool,
    pub search_forwards: bool,
    pub search_backwards: bool,
    pub break_forwards_at: Option<StopPredicate<'a>>,
    pub break_backwards_at: Option<StopPredicate<'a>>,
}

impl FindOpts<'_> {
    pub fn new() -> Self {
        FindOpts {
            search_sidelines: true,
            recurse_sidelines: false,
            search_forwards: true,
            search_backwards: true,
            break_forwards_at: None,
            break_backwards_at: None,
        }
    }
}

/// Resolve a textual move reference like "e4", "8.Nxe5" or "12..." to a node.
///
/// The reference is split into an optional move number and an optional SAN
/// fragment. The forward phase searches breadth-first from the node after the
/// cursor, bounded by the move number; the backward phase walks parent links.
/// The first match wins, forward before backward. The cursor node itself
/// never matches. Returns None when nothing matches; that is not an error.
pub fn find(tree: &GameTree, reference: &str, opts: &FindOpts) -> Option<NodeId> {
    let (move_number, fragment) = match MoveNumber::parse_prefix(reference) {
        Some((number, rest)) => (Some(number), (!rest.is_empty()).then_some(rest)),
        None => (None, (!reference.is_empty()).then_some(reference)),
    };

    let cursor = tree.cursor();
    let check = |node: NodeId| -> bool {
        if node == cursor {
            return false;
        }
        if let Some(fragment) = fragment {
            let parent = match tree.parent(node) {
                Some(p) => p,
                None => return false,
            };
            match parse_san(tree.position(parent), fragment) {
                Ok(mv) => {
                    if tree.node_move(node) != Some(&mv) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        !(move_number.is_some() && move_number != tree.move_number(node))
    };

    // Forward search starts at the cursor itself, or at the first move of
    // the game when the cursor is at the root.
    let start = if cursor == ROOT {
        if !opts.search_forwards {
            return None;
        }
        tree.next(ROOT)?
    } else {
        cursor
    };

    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(start);
    if opts.search_sidelines {
        queue.extend(tree.siblings(start));
    }

    if opts.search_forwards
        && move_number.is_none_or(|number| Some(number) >= tree.move_number(start))
    {
        while let Some(node) = queue.pop_front() {
            if check(node) {
                return Some(node);
            }
            if let Some(stop) = opts.break_forwards_at {
                if stop(tree, node) {
                    break;
                }
            }
            if let Some(number) = move_number {
                // Overshot the bound: everything further is later still.
                if Some(number) < tree.move_number(node) {
                    break;
                }
            }
            if tree.is_first_variation(node) || opts.recurse_sidelines || node == start {
                if opts.search_sidelines {
                    queue.extend(tree.children(node).iter().copied());
                } else if let Some(next) = tree.next(node) {
                    queue.push_back(next);
                }
            }
        }
    }

    if opts.search_backwards
        && move_number.is_none_or(|number| Some(number) < tree.move_number(start))
    {
        let mut node = start;
        while let Some(parent) = tree.parent(node) {
            if parent == ROOT {
                break;
            }
            node = parent;
            if check(node) {
                return Some(node);
            }
            if let Some(stop) = opts.break_backwards_at {
                if stop(tree, node) {
                    break;
                }
            }
            if let Some(number) = move_number {
                if Some(number) > tree.move_number(node) {
                    break;
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movenum::MoveNumber;
    use shakmaty::Color;

    /// 1.e4 e5 2.Nf3 (2.Nc3 Nf6) 2...Nc6 3.Bb5 a6 4.Ba4 Nf6 5.O-O
    fn sample_tree() -> GameTree {
        let mut tree = GameTree::new();
        for san in ["e4", "e5"] {
            let node = tree.add_variation_san(tree.cursor(), san).unwrap();
            tree.set_cursor(node);
        }
        let after_e5 = tree.cursor();
        let nc3 = tree.add_variation_san(after_e5, "Nc3").unwrap();
        tree.add_variation_san(nc3, "Nf6").unwrap();
        let nf3 = tree.add_variation_san(after_e5, "Nf3").unwrap();
        tree.set_cursor(nf3);
        for san in ["Nc6", "Bb5", "a6", "Ba4", "Nf6", "O-O"] {
            let node = tree.add_variation_san(tree.cursor(), san).unwrap();
            tree.set_cursor(node);
        }
        // The Ruy Lopez line is the mainline, 2.Nc3 the sideline.
        tree.promote_to_mainline(nf3);
        tree
    }

    fn cursor_at(tree: &mut GameTree, san: &str) {
        tree.set_cursor(ROOT);
        let opts = FindOpts {
            recurse_sidelines: true,
            ..FindOpts::new()
        };
        let node = find(tree, san, &opts).unwrap();
        tree.set_cursor(node);
    }

    #[test]
    fn find_by_san_forward() {
        let mut tree = sample_tree();
        cursor_at(&mut tree, "e5");
        let node = find(&tree, "Bb5", &FindOpts::new()).unwrap();
        assert_eq!(tree.san(node), Some("Bb5"));
    }

    #[test]
    fn find_by_move_number_forward() {
        let mut tree = sample_tree();
        cursor_at(&mut tree, "2.Nf3");
        // "5." resolves to the first node with move number (5, White) on the
        // reachable main line.
        let node = find(&tree, "5.", &FindOpts::new()).unwrap();
        assert_eq!(tree.move_number(node), Some(MoveNumber::new(5, Color::White)));
        assert_eq!(tree.san(node), Some("O-O"));
    }

    #[test]
    fn find_backward() {
        let mut tree = sample_tree();
        cursor_at(&mut tree, "4...Nf6");
        let node = find(&tree, "1.e4", &FindOpts::new()).unwrap();
        assert_eq!(tree.san(node), Some("e4"));
        assert_eq!(tree.move_number(node), Some(MoveNumber::new(1, Color::White)));
    }

    #[test]
    fn never_returns_cursor() {
        let mut tree = sample_tree();
        cursor_at(&mut tree, "3.Bb5");
        // The reference resolves exactly to the cursor's own move, so the
        // locator must not return it; there is no other Bb5 to find.
        assert_eq!(find(&tree, "3.Bb5", &FindOpts::new()), None);
    }

    #[test]
    fn forward_search_respects_bound() {
        let mut tree = sample_tree();
        cursor_at(&mut tree, "e5");
        let bound = MoveNumber::new(3, Color::White);
        let visited: std::cell::RefCell<Vec<Option<MoveNumber>>> = Default::default();
        // A never-breaking stop predicate that records every visited node:
        // none may exceed the move number bound.
        let record = |t: &GameTree, n: NodeId| {
            visited.borrow_mut().push(t.move_number(n));
            false
        };
        let opts = FindOpts {
            search_backwards: false,
            break_forwards_at: Some(&record),
            ..FindOpts::new()
        };
        let node = find(&tree, "3.", &opts);
        assert_eq!(tree.move_number(node.unwrap()), Some(bound));
        for number in visited.into_inner() {
            assert!(number <= Some(bound));
        }
    }

    #[test]
    fn sideline_is_found_only_with_sidelines() {
        let mut tree = sample_tree();
        cursor_at(&mut tree, "e5");
        let opts = FindOpts {
            recurse_sidelines: true,
            ..FindOpts::new()
        };
        let node = find(&tree, "Nc3", &opts).unwrap();
        assert_eq!(tree.san(node), Some("Nc3"));
        // The 2.Nc3 sideline's continuation is invisible without recursion.
        assert!(find(&tree, "2...Nf6", &FindOpts::new()).is_none());
        let found = find(&tree, "2...Nf6", &opts).unwrap();
        assert_eq!(tree.move_number(found), Some(MoveNumber::new(2, Color::Black)));
    }

    #[test]
    fn not_found_is_none() {
        let mut tree = sample_tree();
        cursor_at(&mut tree, "e5");
        assert_eq!(find(&tree, "9.Qh5", &FindOpts::new()), None);
        assert_eq!(find(&tree, "Qh5", &FindOpts::new()), None);
    }
}
