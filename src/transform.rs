//! The catalogue of semantics-preserving rewrites.
//!
//! Every transformation clones the program, locates a site in the clone,
//! rewrites it locally and returns the clone; when no suitable site
//! exists the original program is returned unchanged. Under wrap-around
//! 32-bit arithmetic each rewrite leaves the printed output of the
//! compiled program identical.

use rand::rngs::SmallRng;
use rand::Rng;

use crate::ast::{Expr, ExprKind, NodeId, Program, Type};
use crate::select::{
    block_sites, int_literal_sites, int_literal_sites_with_value, pick_recent, pick_uniform,
};

pub type Transformation = fn(&Program, &mut SmallRng) -> Program;

/// All rewrites, drawn from uniformly by the search loops.
pub const TRANSFORMATIONS: &[(&str, Transformation)] = &[
    ("int-to-statement-expression", int_to_statement_expression),
    ("int-to-sum", int_to_sum),
    ("int-to-product", int_to_product),
    ("int-to-double-negation", int_to_double_negation),
    ("int-to-conjunction", int_to_conjunction),
    ("int-to-disjunction", int_to_disjunction),
    ("int-to-xor", int_to_xor),
    ("one-to-equality", one_to_equality),
    ("one-to-disequality", one_to_disequality),
    ("int-to-local-variable", int_to_local_variable),
    ("int-to-global-variable", int_to_global_variable),
    ("int-to-helper-function", int_to_helper_function),
    ("int-to-builtin-constant-p", int_to_builtin_constant_p),
    ("int-to-builtin-expect", int_to_builtin_expect),
    ("insert-builtin-prefetch", insert_builtin_prefetch),
    ("insert-dead-if", insert_dead_if),
    ("insert-empty-asm", insert_empty_asm),
    ("insert-builtin-unreachable", insert_builtin_unreachable),
    ("insert-builtin-trap", insert_builtin_trap),
    ("insert-division-by-zero", insert_division_by_zero),
    ("int-to-local-variable-and-asm", int_to_local_variable_and_asm),
];

/// Applies one uniformly chosen transformation.
pub fn apply_random(p: &Program, rng: &mut SmallRng) -> Program {
    let (_, t) = TRANSFORMATIONS[rng.gen_range(0..TRANSFORMATIONS.len())];
    t(p, rng)
}

fn int_lit(p: &mut Program, v: i32) -> Expr {
    p.node(ExprKind::IntLiteral(v))
}

fn variable(p: &mut Program, name: &str) -> Expr {
    p.node(ExprKind::Variable(name.to_string()))
}

fn binop(p: &mut Program, op: &'static str, lhs: Expr, rhs: Expr) -> Expr {
    p.node(ExprKind::BinOp {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn call_named(p: &mut Program, name: &str, args: Vec<Expr>) -> Expr {
    let callee = variable(p, name);
    p.node(ExprKind::Call {
        callee: Box::new(callee),
        args,
    })
}

fn expr_stmt(p: &mut Program, e: Expr) -> Expr {
    p.node(ExprKind::ExprStmt(Box::new(e)))
}

fn replace_expr(p: &mut Program, id: NodeId, replacement: Expr) {
    if let Some(slot) = p.find_expr_mut(id) {
        *slot = replacement;
    }
}

fn insert_into_block(p: &mut Program, block: NodeId, stmt: Expr, rng: &mut SmallRng) {
    if let Some(slot) = p.find_expr_mut(block) {
        if let ExprKind::Block(stmts) = &mut slot.kind {
            let at = rng.gen_range(0..=stmts.len());
            stmts.insert(at, stmt);
        }
    }
}

/// Splits `v` into `(a, b)` with `a + b == v` and no 32-bit overflow in
/// either the split or the generated program.
pub(crate) fn split_sum(v: i32, rng: &mut SmallRng) -> (i32, i32) {
    let v64 = v as i64;
    let (lo, hi) = if v >= 0 {
        (v64 - i32::MAX as i64, i32::MAX as i64)
    } else {
        (i32::MIN as i64, v64 - i32::MIN as i64)
    };
    let a = rng.gen_range(lo..=hi);
    (a as i32, (v64 - a) as i32)
}

/// Factors `v` into `(x, y)` with `x * y == v` exactly; `None` when
/// `|v| <= 1` leaves nothing to factor.
pub(crate) fn split_product(v: i32, rng: &mut SmallRng) -> Option<(i32, i32)> {
    let a = v.unsigned_abs();
    if a <= 1 {
        return None;
    }
    let b = rng.gen_range(1..a);
    let x = gcd(a, b) as i32;
    Some((x, v / x))
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// `v` -> `({ {} v; })`
fn int_to_statement_expression(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let lit = int_lit(&mut new_p, v);
    let last = new_p.node(ExprKind::ExprStmt(Box::new(lit)));
    let block = new_p.node(ExprKind::Block(Vec::new()));
    let replacement = new_p.node(ExprKind::StmtExpr {
        block: Box::new(block),
        last: Box::new(last),
    });
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> `(a) + (b)` with `a + b == v`
fn int_to_sum(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let (a, b) = split_sum(v, rng);
    let a_expr = int_lit(&mut new_p, a);
    let b_expr = int_lit(&mut new_p, b);
    let replacement = binop(&mut new_p, "+", a_expr, b_expr);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> `(x) * (y)` with `x * y == v`; aborts on `|v| <= 1`
fn int_to_product(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };
    let Some((x, y)) = split_product(v, rng) else {
        return p.clone();
    };

    let x_expr = int_lit(&mut new_p, x);
    let y_expr = int_lit(&mut new_p, y);
    let replacement = binop(&mut new_p, "*", x_expr, y_expr);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> `~(~v)`
fn int_to_double_negation(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let arg = int_lit(&mut new_p, !v);
    let replacement = new_p.node(ExprKind::PreOp {
        op: "~",
        arg: Box::new(arg),
    });
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> `(v|r) & (v|~r)`
fn int_to_conjunction(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let r: i32 = rng.gen();
    let a_expr = int_lit(&mut new_p, v | r);
    let b_expr = int_lit(&mut new_p, v | !r);
    let replacement = binop(&mut new_p, "&", a_expr, b_expr);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> `(v&r) | (v&~r)`
fn int_to_disjunction(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let r: i32 = rng.gen();
    let a_expr = int_lit(&mut new_p, v & r);
    let b_expr = int_lit(&mut new_p, v & !r);
    let replacement = binop(&mut new_p, "|", a_expr, b_expr);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> `(~r) ^ (r ^ ~v)`
fn int_to_xor(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let r: i32 = rng.gen();
    let a_expr = int_lit(&mut new_p, !r);
    let b_expr = int_lit(&mut new_p, r ^ !v);
    let replacement = binop(&mut new_p, "^", a_expr, b_expr);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// literal `1` -> `(r) == (r)`
fn one_to_equality(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_uniform(int_literal_sites_with_value(&new_p, 1), rng) else {
        return p.clone();
    };

    let r: i32 = rng.gen();
    let a_expr = int_lit(&mut new_p, r);
    let b_expr = int_lit(&mut new_p, r);
    let replacement = binop(&mut new_p, "==", a_expr, b_expr);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// literal `1` -> `(r1) != (r2)` with `r1 != r2`
fn one_to_disequality(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_uniform(int_literal_sites_with_value(&new_p, 1), rng) else {
        return p.clone();
    };

    let r1: i32 = rng.gen();
    let mut r2: i32 = rng.gen();
    while r2 == r1 {
        r2 = rng.gen();
    }
    let a_expr = int_lit(&mut new_p, r1);
    let b_expr = int_lit(&mut new_p, r2);
    let replacement = binop(&mut new_p, "!=", a_expr, b_expr);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> fresh local `int idN = v;` at the top of the enclosing body
fn int_to_local_variable(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let (Some(v), Some(fn_ref)) = (site.int_value, site.fn_ref) else {
        return p.clone();
    };

    let name = new_p.new_ident();
    let var = variable(&mut new_p, &name);
    let init = int_lit(&mut new_p, v);
    let decl = new_p.node(ExprKind::DeclStmt {
        ty: Type::Int,
        var: Box::new(var),
        init: Box::new(init),
    });
    new_p.fn_body_mut(fn_ref).insert(0, decl);

    let replacement = variable(&mut new_p, &name);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> fresh global `int idN = v;` prepended to the top-level decls
fn int_to_global_variable(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let name = new_p.new_ident();
    let var = variable(&mut new_p, &name);
    let init = int_lit(&mut new_p, v);
    let decl = new_p.node(ExprKind::DeclStmt {
        ty: Type::Int,
        var: Box::new(var),
        init: Box::new(init),
    });
    new_p.toplevel_decls.insert(0, decl);

    let replacement = variable(&mut new_p, &name);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> call of a fresh nullary helper `int idN() { return v; }`
fn int_to_helper_function(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let name = new_p.new_ident();
    let lit = int_lit(&mut new_p, v);
    let ret = new_p.node(ExprKind::ReturnStmt(Box::new(lit)));
    let body = new_p.node(ExprKind::Block(vec![ret]));
    new_p.toplevel_fns.insert(
        0,
        crate::ast::Function {
            name: name.clone(),
            return_type: Type::Int,
            arg_types: Vec::new(),
            body,
        },
    );

    let replacement = call_named(&mut new_p, &name, Vec::new());
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> `(__builtin_constant_p(v)) ? (v) : (v)`
fn int_to_builtin_constant_p(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let arg = int_lit(&mut new_p, v);
    let guard = call_named(&mut new_p, "__builtin_constant_p", vec![arg]);
    let a_expr = int_lit(&mut new_p, v);
    let b_expr = int_lit(&mut new_p, v);
    let replacement = new_p.node(ExprKind::TernOp {
        op1: "?",
        op2: ":",
        arg1: Box::new(guard),
        arg2: Box::new(a_expr),
        arg3: Box::new(b_expr),
    });
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// `v` -> `__builtin_expect(v, w)`; the hint `w` matches `v` one time in
/// four and is random otherwise, the value is `v` either way
fn int_to_builtin_expect(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let Some(v) = site.int_value else {
        return p.clone();
    };

    let w = if rng.gen_range(0..4) == 0 { v } else { rng.gen() };
    let v_expr = int_lit(&mut new_p, v);
    let w_expr = int_lit(&mut new_p, w);
    let replacement = call_named(&mut new_p, "__builtin_expect", vec![v_expr, w_expr]);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

/// inserts `__builtin_prefetch((void *) (r));` into a random block
fn insert_builtin_prefetch(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_uniform(block_sites(&new_p, false), rng) else {
        return p.clone();
    };

    let r: i32 = rng.gen();
    let addr = int_lit(&mut new_p, r);
    let cast = new_p.node(ExprKind::Cast(Type::VoidPtr, Box::new(addr)));
    let prefetch = call_named(&mut new_p, "__builtin_prefetch", vec![cast]);
    let stmt = expr_stmt(&mut new_p, prefetch);
    insert_into_block(&mut new_p, site.id, stmt, rng);
    new_p
}

/// inserts `if (c) {} else {}` with a constant condition; the dead branch
/// is wrapped so later mutations can target it as unreachable
fn insert_dead_if(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_uniform(block_sites(&new_p, false), rng) else {
        return p.clone();
    };

    let c = rng.gen_range(0..=1);
    let cond = int_lit(&mut new_p, c);
    let then_block = new_p.node(ExprKind::Block(Vec::new()));
    let else_block = new_p.node(ExprKind::Block(Vec::new()));
    let (then_stmt, else_stmt) = if c == 1 {
        let dead = new_p.node(ExprKind::Unreachable(Box::new(else_block)));
        (then_block, dead)
    } else {
        let dead = new_p.node(ExprKind::Unreachable(Box::new(then_block)));
        (dead, else_block)
    };
    let stmt = new_p.node(ExprKind::IfStmt {
        cond: Box::new(cond),
        then_stmt: Box::new(then_stmt),
        else_stmt: Some(Box::new(else_stmt)),
    });
    insert_into_block(&mut new_p, site.id, stmt, rng);
    new_p
}

/// inserts `asm [volatile] ("");` into a random block
fn insert_empty_asm(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_uniform(block_sites(&new_p, false), rng) else {
        return p.clone();
    };

    let stmt = new_p.node(ExprKind::AsmStmt {
        volatile_: rng.gen_bool(0.5),
        outputs: Vec::new(),
        inputs: Vec::new(),
    });
    insert_into_block(&mut new_p, site.id, stmt, rng);
    new_p
}

fn insert_unreachable_only_stmt(
    p: &Program,
    rng: &mut SmallRng,
    build: fn(&mut Program) -> Expr,
) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_uniform(block_sites(&new_p, true), rng) else {
        return p.clone();
    };
    let stmt = build(&mut new_p);
    insert_into_block(&mut new_p, site.id, stmt, rng);
    new_p
}

/// inserts `__builtin_unreachable();` into a dynamically dead block
fn insert_builtin_unreachable(p: &Program, rng: &mut SmallRng) -> Program {
    insert_unreachable_only_stmt(p, rng, |p| {
        let call = call_named(p, "__builtin_unreachable", Vec::new());
        expr_stmt(p, call)
    })
}

/// inserts `__builtin_trap();` into a dynamically dead block
fn insert_builtin_trap(p: &Program, rng: &mut SmallRng) -> Program {
    insert_unreachable_only_stmt(p, rng, |p| {
        let call = call_named(p, "__builtin_trap", Vec::new());
        expr_stmt(p, call)
    })
}

/// inserts `(1) / (0);` into a dynamically dead block
fn insert_division_by_zero(p: &Program, rng: &mut SmallRng) -> Program {
    insert_unreachable_only_stmt(p, rng, |p| {
        let one = int_lit(p, 1);
        let zero = int_lit(p, 0);
        let div = binop(p, "/", one, zero);
        expr_stmt(p, div)
    })
}

/// `v` -> fresh local plus an empty asm with a `"+r"` clobber on it; the
/// asm body writes nothing, so the declared value survives
fn int_to_local_variable_and_asm(p: &Program, rng: &mut SmallRng) -> Program {
    let mut new_p = p.next_generation();
    let Some(site) = pick_recent(int_literal_sites(&new_p), rng) else {
        return p.clone();
    };
    let (Some(v), Some(fn_ref)) = (site.int_value, site.fn_ref) else {
        return p.clone();
    };

    let name = new_p.new_ident();
    let var = variable(&mut new_p, &name);
    let init = int_lit(&mut new_p, v);
    let decl = new_p.node(ExprKind::DeclStmt {
        ty: Type::Int,
        var: Box::new(var),
        init: Box::new(init),
    });
    let operand = variable(&mut new_p, &name);
    let constraint = new_p.node(ExprKind::AsmConstraint {
        constraint: "+r",
        expr: Box::new(operand),
    });
    let asm = new_p.node(ExprKind::AsmStmt {
        volatile_: rng.gen_bool(0.5),
        outputs: vec![constraint],
        inputs: Vec::new(),
    });

    let body = new_p.fn_body_mut(fn_ref);
    body.insert(0, decl);
    body.insert(1, asm);

    let replacement = variable(&mut new_p, &name);
    replace_expr(&mut new_p, site.id, replacement);
    new_p
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    #[test]
    fn sum_split_never_overflows() {
        let mut r = rng(1);
        for _ in 0..1_000_000 {
            let v: i32 = r.gen();
            let (a, b) = split_sum(v, &mut r);
            assert_eq!(a as i64 + b as i64, v as i64);
        }
        for v in [0, 1, -1, i32::MIN, i32::MAX] {
            for _ in 0..1000 {
                let (a, b) = split_sum(v, &mut r);
                assert_eq!(a as i64 + b as i64, v as i64);
            }
        }
    }

    #[test]
    fn product_split_is_exact_and_nonzero() {
        let mut r = rng(2);
        for _ in 0..100_000 {
            let v: i32 = r.gen();
            match split_product(v, &mut r) {
                Some((x, y)) => {
                    assert_ne!(x, 0);
                    assert_ne!(y, 0);
                    assert_eq!((x as i64) * (y as i64), v as i64);
                }
                None => assert!(v.unsigned_abs() <= 1),
            }
        }
        assert!(split_product(0, &mut r).is_none());
        assert!(split_product(1, &mut r).is_none());
        assert!(split_product(-1, &mut r).is_none());
        assert!(split_product(i32::MIN, &mut r).is_some());
    }

    #[test]
    fn bitwise_identities_hold() {
        let mut r = rng(3);
        for _ in 0..100_000 {
            let v: i32 = r.gen();
            let x: i32 = r.gen();
            assert_eq!((v | x) & (v | !x), v);
            assert_eq!((v & x) | (v & !x), v);
            assert_eq!((!x) ^ (x ^ !v), v);
            assert_eq!(!(!v), v);
        }
    }

    #[test]
    fn sum_rewrites_the_return_literal() {
        let mut r = rng(4);
        let p = Program::new(42);
        let q = int_to_sum(&p, &mut r);
        let ExprKind::Block(stmts) = &q.toplevel_fn.body.kind else {
            panic!("body is a block");
        };
        let ExprKind::ReturnStmt(e) = &stmts[0].kind else {
            panic!("body returns");
        };
        let ExprKind::BinOp { op, lhs, rhs } = &e.kind else {
            panic!("literal became a sum");
        };
        assert_eq!(*op, "+");
        let (ExprKind::IntLiteral(a), ExprKind::IntLiteral(b)) = (&lhs.kind, &rhs.kind) else {
            panic!("both operands are literals");
        };
        assert_eq!(*a as i64 + *b as i64, 42);
        assert!(q.source_text().contains(") + ("));
    }

    #[test]
    fn local_variable_rewrite_shapes_the_body() {
        let mut r = rng(5);
        let p = Program::new(42);
        let q = int_to_local_variable(&p, &mut r);
        let text = q.source_text();
        assert!(text.contains("int id1 = 42;"));
        assert!(text.contains("return id1;"));
    }

    #[test]
    fn global_variable_rewrite_hoists_the_literal() {
        let mut r = rng(6);
        let p = Program::new(42);
        let q = int_to_global_variable(&p, &mut r);
        let text = q.source_text();
        assert!(text.starts_with("extern \"C\""));
        assert!(text.contains("int id1 = 42;"));
        assert_eq!(q.toplevel_decls.len(), 1);
    }

    #[test]
    fn helper_function_rewrite_calls_the_helper() {
        let mut r = rng(7);
        let p = Program::new(42);
        let q = int_to_helper_function(&p, &mut r);
        let text = q.source_text();
        assert!(text.contains("int id1()"));
        assert!(text.contains("return 42;"));
        assert!(text.contains("return id1();"));
    }

    #[test]
    fn asm_clobber_rewrite_shapes_the_body() {
        let mut r = rng(8);
        let p = Program::new(42);
        let q = int_to_local_variable_and_asm(&p, &mut r);
        let text = q.source_text();
        assert!(text.contains("int id1 = 42;"));
        assert!(text.contains("\"+r\" (id1)"));
        assert!(text.contains("return id1;"));
    }

    #[test]
    fn dead_if_enables_unreachable_inserts() {
        let mut r = rng(9);
        let p = Program::new(42);
        let q = insert_dead_if(&p, &mut r);
        assert!(q.source_text().contains("if ("));
        assert_eq!(block_sites(&q, true).len(), 1);

        let q2 = insert_builtin_unreachable(&q, &mut r);
        assert!(q2.source_text().contains("__builtin_unreachable()"));
    }

    #[test]
    fn unreachable_inserts_noop_without_dead_branch() {
        let mut r = rng(10);
        let p = Program::new(42);
        for t in [
            insert_builtin_unreachable as Transformation,
            insert_builtin_trap,
            insert_division_by_zero,
        ] {
            let q = t(&p, &mut r);
            assert_eq!(q.source_text(), p.source_text());
        }
    }

    #[test]
    fn one_rewrites_only_touch_value_one() {
        let mut r = rng(11);
        let p = Program::new(42);
        // no literal 1 anywhere: both rewrites must return the program unchanged
        assert_eq!(one_to_equality(&p, &mut r).source_text(), p.source_text());
        assert_eq!(one_to_disequality(&p, &mut r).source_text(), p.source_text());

        let one = Program::new(1);
        let q = one_to_equality(&one, &mut r);
        assert!(q.source_text().contains(") == ("));
        let q = one_to_disequality(&one, &mut r);
        assert!(q.source_text().contains(") != ("));
    }

    #[test]
    fn statement_expression_rewrite_prints_gnu_form() {
        let mut r = rng(12);
        let p = Program::new(42);
        let q = int_to_statement_expression(&p, &mut r);
        let text = q.source_text();
        assert!(text.contains("({ {"));
        assert!(text.contains("42;\n})"));
    }

    #[test]
    fn product_aborts_on_unit_values() {
        let mut r = rng(13);
        for v in [0, 1, -1] {
            let p = Program::new(v);
            let q = int_to_product(&p, &mut r);
            assert_eq!(q.source_text(), p.source_text());
        }
    }

    #[test]
    fn builtin_rewrites_keep_the_value_visible() {
        let mut r = rng(14);
        let p = Program::new(42);
        let q = int_to_builtin_constant_p(&p, &mut r);
        assert!(q
            .source_text()
            .contains("(__builtin_constant_p(42)) ? (42) : (42)"));

        let q = int_to_builtin_expect(&p, &mut r);
        assert!(q.source_text().contains("__builtin_expect(42, "));
    }

    #[test]
    fn long_random_walks_keep_a_printable_program() {
        let mut r = rng(15);
        let mut p = Program::new(42);
        for _ in 0..50 {
            p = apply_random(&p, &mut r);
        }
        let text = p.source_text();
        assert!(text.contains("extern int printf"));
        assert!(text.contains("int main(int argc, char *argv[])"));
        assert_eq!(p.expected_value, 42);
    }
}
