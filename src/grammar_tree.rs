//! Untyped grammar tree for the grammar-mode engine.
//!
//! A node is either a fixed string fragment (never replaced) or a
//! sequence of children; a leaf is a non-fixed childless node, i.e. a
//! non-terminal a production may still expand. Subtrees are shared
//! (`Rc`), so replacement rebuilds only the spine above the changed node
//! and leaf enumeration deduplicates on node identity.
//!
//! Rules are external data. A rule file holds one expansion per line;
//! `#` comments and blank lines are skipped. Inside a line, `[...]`
//! spans become replaceable non-terminal children and bare spans become
//! fixed text; `\[` and `\]` escape literal brackets.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::rc::Rc;

/// One grammar tree node.
#[derive(Clone, Debug, Default)]
pub struct GNode {
    pub text: String,
    pub children: Vec<Rc<GNode>>,
    /// Fixed nodes cannot be replaced through mutation.
    pub fixed: bool,
}

impl GNode {
    pub fn fixed(text: &str) -> GNode {
        GNode {
            text: text.to_string(),
            children: Vec::new(),
            fixed: true,
        }
    }

    pub fn open(text: &str) -> GNode {
        GNode {
            text: text.to_string(),
            children: Vec::new(),
            fixed: false,
        }
    }

    /// Flattened program text: all fragments in pre-order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        out.push_str(&self.text);
        for child in &self.children {
            child.render_into(out);
        }
    }

    /// Textual size when flattened; used by test case scoring.
    pub fn size(&self) -> usize {
        let mut n = self.text.len();
        for child in &self.children {
            n += child.size();
        }
        n
    }
}

/// Returns a new root with `target` replaced by `replacement`, sharing
/// every untouched subtree with the old root. Assumes one occurrence:
/// the first spine found wins.
pub fn replace(root: &Rc<GNode>, target: &Rc<GNode>, replacement: Rc<GNode>) -> Rc<GNode> {
    if Rc::ptr_eq(root, target) {
        return replacement;
    }
    for (i, child) in root.children.iter().enumerate() {
        let new_child = replace(child, target, replacement.clone());
        if !Rc::ptr_eq(&new_child, child) {
            let mut ret = (**root).clone();
            ret.children[i] = new_child;
            return Rc::new(ret);
        }
    }
    root.clone()
}

/// Enumerates the still-expandable non-terminals: non-fixed childless
/// nodes, each reported once even when sharing makes it reachable via
/// several paths.
pub fn find_leaves(root: &Rc<GNode>) -> Vec<Rc<GNode>> {
    let mut result = Vec::new();
    let mut seen: HashSet<*const GNode> = HashSet::new();
    let mut todo: VecDeque<Rc<GNode>> = VecDeque::new();
    todo.push_back(root.clone());

    while let Some(n) = todo.pop_front() {
        if !seen.insert(Rc::as_ptr(&n)) {
            continue;
        }
        if n.children.is_empty() && !n.fixed {
            result.push(n.clone());
        }
        for child in &n.children {
            todo.push_back(child.clone());
        }
    }
    result
}

/// One piece of a rule expansion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RulePiece {
    pub text: String,
    pub fixed: bool,
}

/// A loaded rule table; `rules.len()` is the engine's `nr_mutations`.
#[derive(Clone, Debug, Default)]
pub struct GrammarRules {
    rules: Vec<Vec<RulePiece>>,
}

impl GrammarRules {
    /// Parses rule lines; see the module docs for the format.
    pub fn parse(src: &str) -> GrammarRules {
        let mut rules = Vec::new();
        for line in src.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            rules.push(parse_rule_line(line));
        }
        GrammarRules { rules }
    }

    pub fn from_file(path: &Path) -> std::io::Result<GrammarRules> {
        let mut src = String::new();
        std::fs::File::open(path)?.read_to_string(&mut src)?;
        Ok(GrammarRules::parse(&src))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies rule `rule` to `leaf`: the leaf becomes a sequence of
    /// fixed fragments and fresh non-terminals.
    pub fn mutate(&self, root: &Rc<GNode>, leaf: &Rc<GNode>, rule: usize) -> Rc<GNode> {
        let pieces = &self.rules[rule];
        let replacement = Rc::new(GNode {
            text: String::new(),
            children: pieces
                .iter()
                .map(|piece| {
                    Rc::new(GNode {
                        text: piece.text.clone(),
                        children: Vec::new(),
                        fixed: piece.fixed,
                    })
                })
                .collect(),
            fixed: false,
        });
        replace(root, leaf, replacement)
    }
}

impl fmt::Display for GrammarRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            write!(f, "{}: ", i)?;
            for piece in rule {
                if piece.fixed {
                    write!(f, "{:?} ", piece.text)?;
                } else {
                    write!(f, "<{}> ", piece.text)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn parse_rule_line(line: &str) -> Vec<RulePiece> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some('[') | Some(']')) => {
                current.push(chars.next().expect("peeked escape character"));
            }
            '[' if !in_bracket => {
                if !current.is_empty() {
                    pieces.push(RulePiece {
                        text: std::mem::take(&mut current),
                        fixed: true,
                    });
                }
                in_bracket = true;
            }
            ']' if in_bracket => {
                pieces.push(RulePiece {
                    text: std::mem::take(&mut current),
                    fixed: false,
                });
                in_bracket = false;
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        pieces.push(RulePiece {
            text: current,
            fixed: true,
        });
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_and_open_pieces() {
        let rules = GrammarRules::parse("int [var] = [expr];\n# comment\n\nx\n");
        assert_eq!(rules.len(), 2);
        let first = &rules.rules[0];
        assert_eq!(
            first,
            &vec![
                RulePiece {
                    text: "int ".into(),
                    fixed: true
                },
                RulePiece {
                    text: "var".into(),
                    fixed: false
                },
                RulePiece {
                    text: " = ".into(),
                    fixed: true
                },
                RulePiece {
                    text: "expr".into(),
                    fixed: false
                },
                RulePiece {
                    text: ";".into(),
                    fixed: true
                },
            ]
        );
    }

    #[test]
    fn bracket_escapes_stay_literal() {
        let rules = GrammarRules::parse(r"a\[0\] = [expr]");
        let pieces = &rules.rules[0];
        assert_eq!(pieces[0].text, "a[0] = ");
        assert!(pieces[0].fixed);
        assert_eq!(pieces[1].text, "expr");
        assert!(!pieces[1].fixed);
    }

    #[test]
    fn terminal_rule_leaves_nothing_to_expand() {
        let rules = GrammarRules::parse("x");
        let root = Rc::new(GNode::default());
        let leaves = find_leaves(&root);
        assert_eq!(leaves.len(), 1);

        let mutated = rules.mutate(&root, &leaves[0], 0);
        assert_eq!(mutated.render(), "x");
        assert!(find_leaves(&mutated).is_empty());
    }

    #[test]
    fn expansion_introduces_fresh_leaves() {
        let rules = GrammarRules::parse("if ([cond]) { [stmt] }");
        let root = Rc::new(GNode::default());
        let leaf = find_leaves(&root)[0].clone();
        let mutated = rules.mutate(&root, &leaf, 0);
        assert_eq!(mutated.render(), "if (cond) { stmt }");
        assert_eq!(find_leaves(&mutated).len(), 2);
    }

    #[test]
    fn shared_subtrees_are_reported_once() {
        let shared = Rc::new(GNode::open("leaf"));
        let root = Rc::new(GNode {
            text: String::new(),
            children: vec![shared.clone(), shared.clone()],
            fixed: false,
        });
        let leaves = find_leaves(&root);
        assert_eq!(leaves.len(), 1);
        assert!(Rc::ptr_eq(&leaves[0], &shared));
    }

    #[test]
    fn replace_rebuilds_only_the_spine() {
        let leaf = Rc::new(GNode::open("old"));
        let keep = Rc::new(GNode::fixed("keep"));
        let mid = Rc::new(GNode {
            text: String::new(),
            children: vec![leaf.clone()],
            fixed: false,
        });
        let root = Rc::new(GNode {
            text: String::new(),
            children: vec![keep.clone(), mid.clone()],
            fixed: false,
        });

        let new_root = replace(&root, &leaf, Rc::new(GNode::fixed("new")));
        assert_eq!(new_root.render(), "keepnew");
        // untouched subtree is shared, the spine is fresh
        assert!(Rc::ptr_eq(&new_root.children[0], &keep));
        assert!(!Rc::ptr_eq(&new_root.children[1], &mid));
        // the original tree is intact
        assert_eq!(root.render(), "keepold");
    }

    #[test]
    fn replacing_a_missing_node_returns_the_same_root() {
        let root = Rc::new(GNode::open("root"));
        let stranger = Rc::new(GNode::open("elsewhere"));
        let out = replace(&root, &stranger, Rc::new(GNode::fixed("x")));
        assert!(Rc::ptr_eq(&out, &root));
    }
}
