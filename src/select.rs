//! Enumerates candidate mutation sites in a program and picks one,
//! biased toward recently created nodes.

use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::{Distribution, Geometric};

use crate::ast::{Expr, ExprKind, FnRef, NodeId, Program, VisitCtx, Visitor};

/// Parameter of the geometric distribution used to favour recent nodes.
/// Any site keeps a non-zero probability of selection.
const RECENT_BIAS_P: f64 = 0.1;

/// A selected node, described by everything a transformation needs to
/// re-find and rewrite it in the clone it operates on.
#[derive(Clone, Debug)]
pub struct Site {
    pub id: NodeId,
    pub generation: u32,
    pub fn_ref: Option<FnRef>,
    pub int_value: Option<i32>,
}

/// Collects every visited node accepted by `accept`.
pub fn collect_sites<F>(p: &Program, accept: F) -> Vec<Site>
where
    F: FnMut(&VisitCtx, &Expr) -> bool,
{
    struct Collector<F> {
        accept: F,
        sites: Vec<Site>,
    }
    impl<F: FnMut(&VisitCtx, &Expr) -> bool> Visitor for Collector<F> {
        fn visit_expr(&mut self, ctx: &VisitCtx, expr: &Expr) {
            if (self.accept)(ctx, expr) {
                self.sites.push(Site {
                    id: expr.id,
                    generation: expr.generation,
                    fn_ref: ctx.enclosing_fn(),
                    int_value: match expr.kind {
                        ExprKind::IntLiteral(v) => Some(v),
                        _ => None,
                    },
                });
            }
        }
    }

    let mut c = Collector {
        accept,
        sites: Vec::new(),
    };
    p.visit(&mut c);
    c.sites
}

/// All integer literals inside function bodies.
pub fn int_literal_sites(p: &Program) -> Vec<Site> {
    collect_sites(p, |ctx, e| {
        ctx.enclosing_fn().is_some() && matches!(e.kind, ExprKind::IntLiteral(_))
    })
}

/// All integer literals with a specific value (e.g. exactly 1).
pub fn int_literal_sites_with_value(p: &Program, value: i32) -> Vec<Site> {
    collect_sites(p, |ctx, e| {
        ctx.enclosing_fn().is_some() && matches!(e.kind, ExprKind::IntLiteral(v) if v == value)
    })
}

/// All block statements; with `unreachable_only` restricted to blocks
/// inside the dead branch of a dead `if`.
pub fn block_sites(p: &Program, unreachable_only: bool) -> Vec<Site> {
    collect_sites(p, |ctx, e| {
        matches!(e.kind, ExprKind::Block(_)) && (!unreachable_only || ctx.is_unreachable())
    })
}

/// Draws one site with the most recently created nodes strongly
/// preferred: sort by descending generation, then sample an index from a
/// geometric distribution clamped to the last entry.
pub fn pick_recent(mut sites: Vec<Site>, rng: &mut SmallRng) -> Option<Site> {
    if sites.is_empty() {
        return None;
    }
    // id as tie-break keeps enumeration reproducible under a fixed seed
    sites.sort_by(|a, b| b.generation.cmp(&a.generation).then(b.id.cmp(&a.id)));

    let geo = Geometric::new(RECENT_BIAS_P).expect("valid distribution parameter");
    let mut index = geo.sample(rng) as usize;
    if index >= sites.len() {
        index = sites.len() - 1;
    }
    Some(sites.swap_remove(index))
}

/// Draws one site uniformly.
pub fn pick_uniform(mut sites: Vec<Site>, rng: &mut SmallRng) -> Option<Site> {
    if sites.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..sites.len());
    Some(sites.swap_remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn finds_the_seed_literal() {
        let p = Program::new(42);
        let sites = int_literal_sites(&p);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].int_value, Some(42));
        assert_eq!(sites[0].fn_ref, Some(FnRef::Toplevel));
    }

    #[test]
    fn value_filter_excludes_other_literals() {
        let p = Program::new(42);
        assert!(int_literal_sites_with_value(&p, 1).is_empty());
        assert_eq!(int_literal_sites_with_value(&p, 42).len(), 1);
    }

    #[test]
    fn no_unreachable_blocks_in_seed_program() {
        let p = Program::new(0);
        assert_eq!(block_sites(&p, false).len(), 1);
        assert!(block_sites(&p, true).is_empty());
    }

    #[test]
    fn pick_recent_clamps_to_last_site() {
        let mut rng = SmallRng::seed_from_u64(7);
        let p = Program::new(5);
        // exactly one candidate, so the geometric draw must clamp to it
        for _ in 0..100 {
            let site = pick_recent(int_literal_sites(&p), &mut rng).unwrap();
            assert_eq!(site.int_value, Some(5));
        }
    }

    #[test]
    fn picks_are_repeatable_under_a_fixed_seed() {
        let p = Program::new(13);
        let mut a = SmallRng::seed_from_u64(99);
        let mut b = SmallRng::seed_from_u64(99);
        for _ in 0..32 {
            let x = pick_recent(block_sites(&p, false), &mut a).unwrap();
            let y = pick_recent(block_sites(&p, false), &mut b).unwrap();
            assert_eq!(x.id, y.id);
        }
    }
}
