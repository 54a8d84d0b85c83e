//! Candidate populations and the run-wide coverage ledger.

use std::collections::BTreeSet;
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand_distr::{Distribution, Normal};

use crate::ast::Program;
use crate::execute::MAP_SIZE;
use crate::grammar_tree::{find_leaves, GNode};

/// Valid-mode population bound.
pub const VALID_CAPACITY: usize = 1200;
/// Grammar-mode priority queue bound.
pub const GRAMMAR_CAPACITY: usize = 750;

/// Soft target size for grammar test cases; growth beyond it is penalised.
const MAX_SIZE: usize = 2048;
/// Standard deviation of the random score jitter that breaks ties.
const SCORE_JITTER: f64 = 100.0;

/// A valid-mode candidate: a program plus the adaptive mutation budget.
#[derive(Clone, Debug)]
pub struct ValidCandidate {
    pub program: Program,
    pub nr_failures: u32,
    pub nr_transformations: f64,
}

impl ValidCandidate {
    pub fn new(program: Program) -> ValidCandidate {
        ValidCandidate {
            program,
            nr_failures: 0,
            nr_transformations: 10.0,
        }
    }
}

/// Flat bounded population used by the valid-mode loop. Pushing into a
/// full population is a no-op; candidates otherwise leave only through
/// explicit eviction.
#[derive(Debug, Default)]
pub struct ValidPopulation {
    items: Vec<ValidCandidate>,
    capacity: usize,
}

impl ValidPopulation {
    pub fn new(capacity: usize) -> ValidPopulation {
        ValidPopulation {
            items: Vec::new(),
            capacity,
        }
    }

    pub fn push(&mut self, candidate: ValidCandidate) {
        if self.items.len() < self.capacity {
            self.items.push(candidate);
        }
    }

    pub fn remove(&mut self, index: usize) -> ValidCandidate {
        self.items.remove(index)
    }

    pub fn get_mut(&mut self, index: usize) -> &mut ValidCandidate {
        &mut self.items[index]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A grammar-mode test case with its precomputed score. Lower scores are
/// better; the priority queue surfaces the minimum.
#[derive(Clone, Debug)]
pub struct Testcase {
    pub root: Rc<GNode>,
    pub generation: u32,
    /// Ids of every rule used along this test case's lineage.
    pub mutations: BTreeSet<u32>,
    /// Cumulative usage count of the rules applied on this lineage.
    pub mutation_counter: u32,
    pub new_bits: u32,
    pub score: f64,
}

impl Testcase {
    pub fn new(
        root: Rc<GNode>,
        generation: u32,
        mutations: BTreeSet<u32>,
        mutation_counter: u32,
        new_bits: u32,
        rng: &mut SmallRng,
    ) -> Testcase {
        let counter = mutation_counter.max(1);
        let size = root.size();
        let leaf_count = find_leaves(&root).len();

        let mut score = -(mutations.len() as f64);
        // keep test cases near the soft target size: growth is rewarded
        // below it and penalised above it
        let size_penalty = if size < MAX_SIZE {
            MAX_SIZE
        } else {
            size - MAX_SIZE
        };
        score += (size_penalty / 5) as f64;
        score -= 10.0 * generation as f64;
        // rarely used rules get a boost
        score -= 100.0 * (counter + 1) as f64 / counter as f64;
        score -= 100.0 * new_bits as f64;
        score -= 100.0 * leaf_count as f64;
        let jitter = Normal::new(0.0, SCORE_JITTER).expect("valid normal distribution");
        score += jitter.sample(rng);

        Testcase {
            root,
            generation,
            mutations,
            mutation_counter: counter,
            new_bits,
            score,
        }
    }

    /// The empty tree every restart begins from: a single open leaf.
    pub fn seed(rng: &mut SmallRng) -> Testcase {
        Testcase::new(Rc::new(GNode::default()), 0, BTreeSet::new(), 1, 0, rng)
    }
}

impl PartialEq for Testcase {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Testcase {}

impl PartialOrd for Testcase {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Testcase {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // root identity breaks score ties so distinct trees coexist
        self.score
            .total_cmp(&other.score)
            .then_with(|| (Rc::as_ptr(&self.root) as usize).cmp(&(Rc::as_ptr(&other.root) as usize)))
    }
}

/// Fixed-size priority queue that discards the worst (highest-keyed)
/// entries when full. `top()`/`pop()` operate on the minimum.
#[derive(Debug)]
pub struct FixedPriorityQueue<T: Ord> {
    set: BTreeSet<T>,
    capacity: usize,
}

impl<T: Ord> FixedPriorityQueue<T> {
    pub fn new(capacity: usize) -> FixedPriorityQueue<T> {
        FixedPriorityQueue {
            set: BTreeSet::new(),
            capacity,
        }
    }

    pub fn push(&mut self, x: T) {
        self.set.insert(x);
        while self.set.len() > self.capacity {
            self.set.pop_last();
        }
    }

    pub fn top(&self) -> Option<&T> {
        self.set.first()
    }

    pub fn pop(&mut self) -> Option<T> {
        self.set.pop_first()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Cumulative edge-hit counters across the whole run, plus per-rule usage
/// counters. Reset only at a restart.
#[derive(Debug)]
pub struct CoverageLedger {
    edges: Vec<u32>,
    rules: Vec<u32>,
}

impl CoverageLedger {
    pub fn new(nr_rules: usize) -> CoverageLedger {
        CoverageLedger {
            edges: vec![0; MAP_SIZE],
            rules: vec![0; nr_rules],
        }
    }

    /// Folds one execution's bitmap into the ledger and returns how many
    /// edges were seen for the first time.
    pub fn record(&mut self, map: &[u8]) -> u32 {
        let mut new_bits = 0;
        for (i, &byte) in map.iter().enumerate().take(self.edges.len()) {
            if byte != 0 {
                self.edges[i] += 1;
                if self.edges[i] == 1 {
                    new_bits += 1;
                }
            }
        }
        new_bits
    }

    /// Bumps a rule's usage counter and returns the new count.
    pub fn bump_rule(&mut self, rule: usize) -> u32 {
        self.rules[rule] += 1;
        self.rules[rule]
    }

    /// Total number of edges hit at least once so far.
    pub fn total_edges(&self) -> usize {
        self.edges.iter().filter(|&&c| c > 0).count()
    }

    pub fn reset(&mut self) {
        self.edges.iter_mut().for_each(|c| *c = 0);
        self.rules.iter_mut().for_each(|c| *c = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0)
    }

    #[test]
    fn queue_never_exceeds_capacity() {
        let mut r = rng();
        let mut pq: FixedPriorityQueue<Testcase> = FixedPriorityQueue::new(8);
        for _ in 0..100 {
            pq.push(Testcase::seed(&mut r));
            assert!(pq.len() <= 8);
        }
    }

    #[test]
    fn queue_pops_minimum_first() {
        let mut pq: FixedPriorityQueue<i64> = FixedPriorityQueue::new(4);
        for x in [5, 3, 9, 1] {
            pq.push(x);
        }
        assert_eq!(pq.top(), Some(&1));
        assert_eq!(pq.pop(), Some(1));
        assert_eq!(pq.pop(), Some(3));
    }

    #[test]
    fn queue_evicts_the_worst() {
        let mut pq: FixedPriorityQueue<i64> = FixedPriorityQueue::new(3);
        for x in [10, 20, 30, 5] {
            pq.push(x);
        }
        assert_eq!(pq.len(), 3);
        // 30 was the worst key and must be gone
        assert_eq!(pq.pop(), Some(5));
        assert_eq!(pq.pop(), Some(10));
        assert_eq!(pq.pop(), Some(20));
        assert!(pq.is_empty());
    }

    #[test]
    fn valid_population_is_bounded() {
        let mut pop = ValidPopulation::new(4);
        for v in 0..10 {
            pop.push(ValidCandidate::new(Program::new(v)));
            assert!(pop.len() <= 4);
        }
    }

    #[test]
    fn ledger_counts_only_first_hits() {
        let mut ledger = CoverageLedger::new(4);
        let mut map = vec![0u8; MAP_SIZE];
        map[3] = 1;
        map[100] = 7;
        assert_eq!(ledger.record(&map), 2);
        assert_eq!(ledger.record(&map), 0);
        map[101] = 1;
        assert_eq!(ledger.record(&map), 1);
        assert_eq!(ledger.total_edges(), 3);

        ledger.reset();
        assert_eq!(ledger.total_edges(), 0);
        assert_eq!(ledger.record(&map), 3);
    }

    #[test]
    fn new_edges_improve_the_score() {
        let mut r = rng();
        // jitter sigma is 100, a 50-edge delta dominates it comfortably
        let quiet = Testcase::new(
            Rc::new(GNode::default()),
            1,
            BTreeSet::new(),
            1,
            0,
            &mut r,
        );
        let loud = Testcase::new(
            Rc::new(GNode::default()),
            1,
            BTreeSet::new(),
            1,
            50,
            &mut r,
        );
        assert!(loud.score < quiet.score);
    }
}
