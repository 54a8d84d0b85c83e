//! Executes candidate programs against the instrumented target and runs
//! the two coverage-guided search loops.
//!
//! The target publishes an AFL-style edge bitmap through a System-V
//! shared-memory segment whose id it reads from the environment. Each
//! evaluation creates a fresh segment, feeds the program text to the
//! target's stdin, reaps the child (killing it on timeout in grammar
//! mode) and folds the bitmap into the run-wide ledger.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::channel::oneshot;
use futures::future::FutureExt;
use futures::pin_mut;
use futures::select;

use rand::rngs::SmallRng;
use rand::Rng;

use thiserror::Error;

use crate::ast::Program;
use crate::config::Config;
use crate::corpus::{
    CoverageLedger, FixedPriorityQueue, Testcase, ValidCandidate, ValidPopulation,
    GRAMMAR_CAPACITY, VALID_CAPACITY,
};
use crate::grammar_tree::{find_leaves, GrammarRules};
use crate::transform::{apply_random, TRANSFORMATIONS};

/// Size of the edge bitmap, fixed by the target's instrumentation.
pub const MAP_SIZE: usize = 65536;
/// Environment variable the instrumentation runtime reads the segment id
/// from (AFL convention).
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Substring marking an internal compiler error in the target's stderr.
const ICE_MARKER: &str = "internal compiler error";

/// Stderr capture cap; compilers occasionally dump whole ASTs.
const MAX_STDERR_BYTES: usize = 400 * 1024;

/// Valid mode seeds fresh programs until this many candidates produced
/// new coverage.
const SEED_POPULATION: usize = 250;
/// Transformations applied to every freshly seeded program.
const SEED_TRANSFORMS: usize = 50;
/// A candidate failing to find new edges this often is evicted.
const MAX_FAILURES: u32 = 50;
/// Exponential smoothing factor for the adaptive transformation budget.
const TRANSFORM_SMOOTHING: f64 = 0.85;
/// Grammar mode restarts after this many executions without new edges.
const RESTART_AFTER_STALL: u32 = 500;

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("shmget() failed: {0}")]
    ShmCreate(#[source] io::Error),
    #[error("shmat() failed: {0}")]
    ShmAttach(#[source] io::Error),
    #[error("spawning target {target}: {source}")]
    Spawn {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("the rule file contains no rules")]
    EmptyRules,
    #[error("target terminated abnormally: {0}")]
    TargetCrash(String),
    #[error("internal compiler error (reproducer: {reproducer}):\n{stderr}")]
    InternalCompilerError { reproducer: String, stderr: String },
    #[error("assembling {0} failed:\n{1}")]
    Assemble(String, String),
    #[error("running the compiled program failed: {0}")]
    Inferior(String),
    #[error("miscompilation: program printed {actual}, expected {expected}")]
    Miscompile { expected: i32, actual: i32 },
}

/// How one target execution ended. `TimedOut` is reserved for children
/// the harness itself killed; a SIGKILL from elsewhere still counts as
/// `Signaled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    pub stderr: Vec<u8>,
}

/// RAII owner of one System-V shared-memory segment. Dropping removes
/// and detaches it, so no evaluation path can leak a segment.
pub struct CoverageShm {
    id: libc::c_int,
    base: *mut u8,
}

impl CoverageShm {
    pub fn new() -> Result<CoverageShm, FuzzError> {
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                MAP_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id < 0 {
            return Err(FuzzError::ShmCreate(io::Error::last_os_error()));
        }
        let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if base as isize == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
            }
            return Err(FuzzError::ShmAttach(err));
        }
        Ok(CoverageShm {
            id,
            base: base as *mut u8,
        })
    }

    /// Decimal id for the child's environment.
    pub fn env_value(&self) -> String {
        self.id.to_string()
    }

    /// Copies the edge bitmap out of the segment.
    pub fn snapshot(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.base, MAP_SIZE) }.to_vec()
    }
}

impl Drop for CoverageShm {
    fn drop(&mut self) {
        unsafe {
            libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
            libc::shmdt(self.base as *const libc::c_void);
        }
    }
}

type Reaped = (io::Result<ExitStatus>, Vec<u8>);

pub struct Exec {
    pub cfg: Config,
}

impl Exec {
    /// Prepares the output directories.
    pub fn new(cfg: Config) -> Result<Exec, FuzzError> {
        fs::create_dir_all(&cfg.output_dir)?;
        fs::create_dir_all(&cfg.stderr_dir)?;
        Ok(Exec { cfg })
    }

    /// Runs the target once on `source`, returning the outcome and a
    /// snapshot of the edge bitmap. The shared segment lives exactly as
    /// long as this call.
    pub fn run_target(&self, source: &[u8]) -> Result<(ExecOutcome, Vec<u8>), FuzzError> {
        let shm = CoverageShm::new()?;

        let mut child = Command::new(&self.cfg.target)
            .args(&self.cfg.target_args)
            .env(SHM_ENV_VAR, shm.env_value())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FuzzError::Spawn {
                target: self.cfg.target.display().to_string(),
                source: e,
            })?;
        let pid = child.id() as libc::pid_t;

        let mut stdin = child.stdin.take().expect("stdin is piped");
        let mut stderr = child.stderr.take().expect("stderr is piped");
        let source = source.to_vec();
        let (tx, rx) = oneshot::channel::<Reaped>();

        // The reaper feeds the child and drains stderr concurrently with
        // the child's run; draining before wait() avoids a pipe-full
        // deadlock on large diagnostics.
        std::thread::Builder::new()
            .name("progfuzz-reaper".to_string())
            .spawn(move || {
                // a child that exits early closes the pipe; EPIPE is fine
                let _ = stdin.write_all(&source);
                drop(stdin);
                let mut err_buf = Vec::new();
                let _ = stderr.read_to_end(&mut err_buf);
                err_buf.truncate(MAX_STDERR_BYTES);
                let status = child.wait();
                let _ = tx.send((status, err_buf));
            })?;

        let mut rx = rx.fuse();
        let mut killed = false;
        let reaped = match self.cfg.timeout() {
            Some(limit) => {
                let raced = futures::executor::block_on(async {
                    let killer = async_std::task::sleep(limit).fuse();
                    pin_mut!(killer);
                    select! {
                        reaped = rx => Some(reaped),
                        () = killer => None,
                    }
                });
                match raced {
                    Some(reaped) => reaped,
                    None => {
                        unsafe {
                            libc::kill(pid, libc::SIGKILL);
                        }
                        killed = true;
                        futures::executor::block_on(&mut rx)
                    }
                }
            }
            None => futures::executor::block_on(&mut rx),
        };

        let (status, stderr_buf) = reaped
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reaper thread died"))?;
        let status = status?;

        let status = if killed && status.signal() == Some(libc::SIGKILL) {
            ExecStatus::TimedOut
        } else if let Some(sig) = status.signal() {
            ExecStatus::Signaled(sig)
        } else {
            ExecStatus::Exited(status.code().unwrap_or(-1))
        };

        let map = shm.snapshot();
        Ok((
            ExecOutcome {
                status,
                stderr: stderr_buf,
            },
            map,
        ))
    }

    /// The coverage-guided loop over semantics-preserving mutations.
    pub fn run_valid_loop(&self, rng: &mut SmallRng) -> Result<(), FuzzError> {
        let mut ledger = CoverageLedger::new(TRANSFORMATIONS.len());
        let mut population = ValidPopulation::new(VALID_CAPACITY);

        loop {
            while population.len() < SEED_POPULATION {
                print!("[{:3} new]... ", population.len());
                io::stdout().flush()?;

                let mut p = Program::new(rng.gen());
                for _ in 0..SEED_TRANSFORMS {
                    p = apply_random(&p, rng);
                }
                if self.build_and_run(&p, &mut ledger)? > 0 {
                    population.push(ValidCandidate::new(p));
                }
            }

            let idx = rng.gen_range(0..population.len());
            let (mut p, budget) = {
                let c = population.get_mut(idx);
                print!(
                    "[{:3} | {:2} | {:5.2}]... ",
                    idx, c.nr_failures, c.nr_transformations
                );
                (c.program.clone(), c.nr_transformations.ceil().max(1.0) as usize)
            };
            io::stdout().flush()?;

            for _ in 0..budget {
                p = apply_random(&p, rng);
            }

            let new_bits = self.build_and_run(&p, &mut ledger)?;
            let mut evict = false;
            let c = population.get_mut(idx);
            if new_bits > 0 {
                c.nr_transformations = smooth(c.nr_transformations, c.nr_failures);
                c.nr_failures = 0;
                c.program = p;
            } else {
                c.nr_failures += 1;
                if c.nr_failures >= MAX_FAILURES {
                    evict = true;
                } else {
                    c.nr_transformations = smooth(c.nr_transformations, c.nr_failures);
                }
            }
            if evict {
                population.remove(idx);
            }
        }
    }

    /// Compiles one candidate, verifies its printed value, and reports
    /// how many previously-unseen edges the compiler exercised.
    fn build_and_run(&self, p: &Program, ledger: &mut CoverageLedger) -> Result<u32, FuzzError> {
        let source = p.source_text();
        // scratch copy for post-mortem inspection of the last candidate
        fs::write(
            PathBuf::from(format!("/tmp/current.{}", self.cfg.ext)),
            &source,
        )?;

        let (outcome, map) = self.run_target(source.as_bytes())?;
        match outcome.status {
            ExecStatus::TimedOut => Ok(0),
            ExecStatus::Signaled(sig) => {
                let path = self.save_specimen(source.as_bytes(), Some(&outcome.stderr))?;
                Err(FuzzError::TargetCrash(format!(
                    "killed by signal {} (reproducer: {})",
                    sig,
                    path.display()
                )))
            }
            ExecStatus::Exited(code) if code != 0 => {
                let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();
                if self.is_known_ice(&stderr) {
                    println!("target exit code {} (known ICE, ignored)", code);
                    return Ok(0);
                }
                let path = self.save_specimen(source.as_bytes(), Some(&outcome.stderr))?;
                if stderr.contains(ICE_MARKER) {
                    Err(FuzzError::InternalCompilerError {
                        reproducer: path.display().to_string(),
                        stderr,
                    })
                } else {
                    Err(FuzzError::TargetCrash(format!(
                        "exit code {} (reproducer: {})",
                        code,
                        path.display()
                    )))
                }
            }
            ExecStatus::Exited(_) => {
                self.check_expected(p)?;
                let new_bits = ledger.record(&map);
                println!("{} bits; {} new", ledger.total_edges(), new_bits);
                Ok(new_bits)
            }
        }
    }

    /// Assembles the target's `.s` output, runs the binary under a pipe
    /// and compares the printed integer against the program's expected
    /// value. A mismatch is a confirmed miscompilation.
    fn check_expected(&self, p: &Program) -> Result<(), FuzzError> {
        let bin = self.cfg.asm_out.with_extension("out");
        let assembled = Command::new(&self.cfg.cc_path)
            .arg(&self.cfg.asm_out)
            .arg("-o")
            .arg(&bin)
            .output()?;
        if !assembled.status.success() {
            return Err(FuzzError::Assemble(
                self.cfg.asm_out.display().to_string(),
                String::from_utf8_lossy(&assembled.stderr).into_owned(),
            ));
        }

        let run = Command::new(Path::new(".").join(&bin)).output()?;
        if !run.status.success() {
            return Err(FuzzError::Inferior(format!("{}", run.status)));
        }
        let text = String::from_utf8_lossy(&run.stdout);
        let actual: i32 = text
            .trim()
            .parse()
            .map_err(|_| FuzzError::Inferior(format!("unparsable output {:?}", text)))?;
        if actual != p.expected_value {
            return Err(FuzzError::Miscompile {
                expected: p.expected_value,
                actual,
            });
        }
        Ok(())
    }

    /// The priority-queue loop over grammar expansions.
    pub fn run_grammar_loop(
        &self,
        rules: &GrammarRules,
        rng: &mut SmallRng,
    ) -> Result<(), FuzzError> {
        if rules.is_empty() {
            return Err(FuzzError::EmptyRules);
        }

        let colorcode_red = if !self.cfg.plaintext { "\x1b[31m" } else { "" };
        let colorcode_green = if !self.cfg.plaintext { "\x1b[32m" } else { "" };
        let colorcode_normal = if !self.cfg.plaintext { "\x1b[0m" } else { "" };

        let mut ledger = CoverageLedger::new(rules.len());
        let mut pq: FixedPriorityQueue<Testcase> = FixedPriorityQueue::new(GRAMMAR_CAPACITY);
        let mut nr_execs: u64 = 0;
        let mut stalled: u32 = 0;

        loop {
            if pq.is_empty() {
                pq.push(Testcase::seed(rng));
            }
            let current = match pq.top() {
                Some(t) => t.clone(),
                None => continue,
            };
            let leaves = find_leaves(&current.root);
            if leaves.is_empty() {
                pq.pop();
                continue;
            }

            let leaf = leaves[rng.gen_range(0..leaves.len())].clone();
            let rule = rng.gen_range(0..rules.len());
            let root = rules.mutate(&current.root, &leaf, rule);
            let source = root.render();

            let (outcome, map) = self.run_target(source.as_bytes())?;
            nr_execs += 1;

            if let ExecStatus::Signaled(sig) = outcome.status {
                let path = self.save_specimen(source.as_bytes(), Some(&outcome.stderr))?;
                eprintln!(
                    "{}target killed by signal {}{}  exec: {}  reproducer: {}",
                    colorcode_red,
                    sig,
                    colorcode_normal,
                    nr_execs,
                    path.display()
                );
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();
            if self.is_unlisted_ice(&stderr) {
                let path = self.save_specimen(source.as_bytes(), Some(&outcome.stderr))?;
                eprintln!(
                    "{}internal compiler error{}  exec: {}  reproducer: {}\n{}",
                    colorcode_red,
                    colorcode_normal,
                    nr_execs,
                    path.display(),
                    stderr
                );
                return Ok(());
            }

            let mut new_bits = 0;
            if outcome.status == ExecStatus::Exited(0) {
                new_bits = ledger.record(&map);
                let counter = ledger.bump_rule(rule);
                let mut mutations = current.mutations.clone();
                mutations.insert(rule as u32);
                let t = Testcase::new(
                    root.clone(),
                    current.generation + 1,
                    mutations,
                    current.mutation_counter + counter,
                    current.new_bits + new_bits,
                    rng,
                );
                let preview: String = source.chars().take(48).collect();
                println!(
                    "{}compiled{} exec: {:<6} score: {:<9.2} queue: {:<4} new bits: {:<3} {}",
                    colorcode_green,
                    colorcode_normal,
                    nr_execs,
                    t.score,
                    pq.len(),
                    new_bits,
                    preview.escape_default()
                );
                pq.push(t);
            }

            if new_bits > 0 {
                stalled = 0;
            } else {
                stalled += 1;
            }
            if stalled >= RESTART_AFTER_STALL {
                if let Some(top) = pq.top() {
                    let path = self.save_specimen(top.root.render().as_bytes(), None)?;
                    println!(
                        "restart after {} stalled execs; best test case saved to {}",
                        stalled,
                        path.display()
                    );
                }
                pq = FixedPriorityQueue::new(GRAMMAR_CAPACITY);
                ledger.reset();
                stalled = 0;
            }
        }
    }

    fn is_known_ice(&self, stderr: &str) -> bool {
        stderr.contains(ICE_MARKER)
            && self
                .cfg
                .ignore_ice
                .iter()
                .any(|pat| stderr.contains(pat.as_str()))
    }

    fn is_unlisted_ice(&self, stderr: &str) -> bool {
        stderr.contains(ICE_MARKER)
            && !self
                .cfg
                .ignore_ice
                .iter()
                .any(|pat| stderr.contains(pat.as_str()))
    }

    /// Writes an interesting test case (and optionally its stderr) to
    /// the output directories under a timestamped name.
    fn save_specimen(&self, source: &[u8], stderr: Option<&[u8]>) -> Result<PathBuf, FuzzError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let pid = std::process::id();
        let path = self
            .cfg
            .output_dir
            .join(format!("{}-{}.{}", ts, pid, self.cfg.ext));
        fs::write(&path, source)?;
        if let Some(stderr) = stderr {
            fs::write(
                self.cfg.stderr_dir.join(format!("{}-{}.txt", ts, pid)),
                stderr,
            )?;
        }
        Ok(path)
    }
}

fn smooth(nr_transformations: f64, nr_failures: u32) -> f64 {
    TRANSFORM_SMOOTHING * nr_transformations
        + (1.0 - TRANSFORM_SMOOTHING) * (10 * nr_failures) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_exec(target: &str, args: &[&str], timeout_ms: Option<u64>) -> Exec {
        let mut cfg = Config::defaults();
        cfg.target = PathBuf::from(target);
        cfg.target_args = args.iter().map(|s| s.to_string()).collect();
        cfg.timeout_ms = timeout_ms;
        let scratch = std::env::temp_dir().join(format!("progfuzz-test-{}", std::process::id()));
        cfg.output_dir = scratch.join("output");
        cfg.stderr_dir = scratch.join("stderr");
        Exec::new(cfg).expect("creating output dirs")
    }

    #[test]
    fn shm_segments_are_released_on_drop() {
        // leaking segments would exhaust the kernel table quickly
        for _ in 0..64 {
            let shm = CoverageShm::new().expect("creating shm segment");
            assert_eq!(shm.snapshot().len(), MAP_SIZE);
        }
    }

    #[test]
    fn fresh_segment_is_zeroed() {
        let shm = CoverageShm::new().unwrap();
        assert!(shm.snapshot().iter().all(|&b| b == 0));
    }

    #[test]
    fn clean_exit_is_reported_with_empty_map() {
        let exec = test_exec("/bin/cat", &[], None);
        let (outcome, map) = exec.run_target(b"hello world\n").unwrap();
        assert_eq!(outcome.status, ExecStatus::Exited(0));
        assert!(outcome.stderr.is_empty());
        // cat is uninstrumented, so no edge ever lights up
        assert_eq!(map.len(), MAP_SIZE);
        assert!(map.iter().all(|&b| b == 0));
    }

    #[test]
    fn stderr_and_exit_code_are_captured() {
        let exec = test_exec("/bin/sh", &["-c", "echo oops >&2; exit 3"], None);
        let (outcome, _) = exec.run_target(b"").unwrap();
        assert_eq!(outcome.status, ExecStatus::Exited(3));
        assert_eq!(String::from_utf8_lossy(&outcome.stderr).trim(), "oops");
    }

    #[test]
    fn child_signals_are_distinguished_from_timeouts() {
        let exec = test_exec("/bin/sh", &["-c", "kill -11 $$"], None);
        let (outcome, _) = exec.run_target(b"").unwrap();
        assert_eq!(outcome.status, ExecStatus::Signaled(libc::SIGSEGV));
    }

    #[test]
    fn hung_children_are_killed_at_the_deadline() {
        let exec = test_exec("/bin/sleep", &["5"], Some(100));
        let start = Instant::now();
        let (outcome, _) = exec.run_target(b"").unwrap();
        assert_eq!(outcome.status, ExecStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn ice_triage_respects_the_ignore_list() {
        let exec = test_exec("/bin/true", &[], None);
        let known = "x.cc:1: internal compiler error: gimplification failed";
        let unknown = "x.cc:1: internal compiler error: in fold_something_new";
        assert!(exec.is_known_ice(known));
        assert!(!exec.is_unlisted_ice(known));
        assert!(exec.is_unlisted_ice(unknown));
        assert!(!exec.is_known_ice("ordinary error: expected ';'"));
    }

    #[test]
    fn smoothing_pulls_the_budget_toward_recent_failures() {
        let mut nr = 10.0;
        for _ in 0..100 {
            nr = smooth(nr, 0);
        }
        assert!(nr < 1e-3);
        let mut nr = 0.0;
        for _ in 0..100 {
            nr = smooth(nr, 5);
        }
        assert!((nr - 50.0).abs() < 1e-3);
    }

    #[test]
    #[ignore = "requires a C++ toolchain on the host"]
    fn transformed_programs_keep_their_value() {
        use crate::transform::apply_random;
        use rand::SeedableRng;

        let dir = std::env::temp_dir().join(format!("progfuzz-e2e-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        for seed in 0..4u64 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut p = Program::new(42);
            for _ in 0..20 {
                p = apply_random(&p, &mut rng);
            }

            let src = dir.join(format!("case-{}.cc", seed));
            let bin = dir.join(format!("case-{}", seed));
            fs::write(&src, p.source_text()).unwrap();

            let compiled = Command::new("g++")
                .arg(&src)
                .arg("-o")
                .arg(&bin)
                .output()
                .expect("running g++");
            assert!(
                compiled.status.success(),
                "g++ rejected the program:\n{}",
                String::from_utf8_lossy(&compiled.stderr)
            );

            let run = Command::new(&bin).output().unwrap();
            assert_eq!(String::from_utf8_lossy(&run.stdout), "42\n");
        }
    }
}
