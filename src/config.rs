use std::env::vars;
use std::path::PathBuf;
use std::time::Duration;

const HELPTXT: &str = r#"
progfuzz: coverage-guided compiler fuzzer

Generates source programs, feeds them to an instrumented compiler via
stdin, and steers mutation by the AFL-style edge bitmap the target
publishes through System-V shared memory.

Options:

  -t, --target <path>        Target compiler executable (required)

  -a, --arg <argument>       Argument passed to the target. May be repeated

  -g, --grammar <path>       Rule file for grammar-based fuzzing; selects
                             grammar mode. Without it the valid-mode
                             engine runs semantics-preserving mutations

  -x, --cc <path>            Assembler driver used by the valid-mode
                             result check. Defaults to '{}'

  --asm-out <path>           Where the target writes its assembly output
                             in valid mode. Defaults to '{}'

  --output-dir <dir>         Directory for interesting test cases.
                             Defaults to '{}'

  -e, --ext <ext>            File extension for saved test cases.
                             Defaults to '{}'

  --timeout <ms>             Kill the target after this many milliseconds.
                             Defaults to {} in grammar mode; valid mode
                             waits unbounded

  -s, --seed <N>             Seed the random engine for a repeatable run

  --ignore-ice <substr>      Treat internal-compiler-error messages
                             containing <substr> as already known.
                             May be repeated; extends the built-in list

  -p, --plaintext            Output status messages in plaintext

Environment overrides: PROGFUZZ_TARGET, PROGFUZZ_CC_PATH,
PROGFUZZ_OUTPUT_DIR

"#;

/// Default timeout for grammar-mode target runs, in milliseconds.
const GRAMMAR_TIMEOUT_MS: u64 = 500;

/// Internal-compiler-error fragments that are already reported upstream
/// and keep re-surfacing; matching reports are not treated as findings.
const KNOWN_ICE_PATTERNS: &[&str] = &[
    "unexpected expression",
    "gimplification failed",
    "types may not be defined in parameter types",
    "in synthesize_implicit_template_parm",
    "in search_anon_aggr",
    "non_type_check",
    "in xref_basetypes",
    "in build_capture_proxy",
    "reduced_constant_expression_p",
];

#[derive(Clone, Debug)]
pub struct Config {
    pub target: PathBuf,
    pub target_args: Vec<String>,
    pub grammar: Option<PathBuf>,
    pub cc_path: PathBuf,
    pub asm_out: PathBuf,
    pub output_dir: PathBuf,
    pub stderr_dir: PathBuf,
    pub ext: String,
    pub timeout_ms: Option<u64>,
    pub seed: Option<u64>,
    pub ignore_ice: Vec<String>,
    pub plaintext: bool,
}

/// Target executor configuration: target command, language mode, output
/// locations and the crash triage knobs.
impl Config {
    /// returns CLI help text including the configured defaults
    pub fn help() -> String {
        let defaults = Config::defaults();
        let mut help = HELPTXT.to_owned();
        for arg in [
            &defaults.cc_path.display().to_string(),
            &defaults.asm_out.display().to_string(),
            &defaults.output_dir.display().to_string(),
            &defaults.ext,
            &format!("{}", GRAMMAR_TIMEOUT_MS),
        ] {
            help = help.replacen("{}", arg, 1);
        }
        help
    }

    /// initialize with default values
    pub fn defaults() -> Self {
        Config {
            target: PathBuf::new(),
            target_args: Vec::new(),
            grammar: None,
            cc_path: PathBuf::from("g++"),
            asm_out: PathBuf::from("prog.s"),
            output_dir: PathBuf::from("output"),
            stderr_dir: PathBuf::from("stderr"),
            ext: "cc".to_string(),
            timeout_ms: None,
            seed: None,
            ignore_ice: KNOWN_ICE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            plaintext: false,
        }
    }

    pub fn is_grammar_mode(&self) -> bool {
        self.grammar.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Update settings as set by environment variables
    pub fn load_env(&mut self) {
        for (k, v) in vars()
            .filter(|kv| kv.0.starts_with("PROGFUZZ_"))
            .collect::<Vec<(String, String)>>()
        {
            println!("{}={}", k, v);
            match k.as_ref() {
                "PROGFUZZ_TARGET" => self.target = PathBuf::from(v),
                "PROGFUZZ_CC_PATH" => self.cc_path = PathBuf::from(v),
                "PROGFUZZ_OUTPUT_DIR" => self.output_dir = PathBuf::from(v),
                _ => {
                    eprintln!("unknown env option {}", k)
                }
            }
        }
    }

    /// Parse command line arguments as a Config struct.
    /// If "-h" or "--help" is given, the help text is printed and the
    /// program exits.
    pub fn parse_args() -> Result<Config, Box<dyn std::error::Error>> {
        let args: Vec<String> = std::env::args().collect();
        let mut cfg = Config::from_arg_list(&args)?;

        if cfg.target.as_os_str().is_empty() {
            eprintln!("Missing --target argument. See --help for more info");
            std::process::exit(1);
        }
        if cfg.timeout_ms.is_none() && cfg.is_grammar_mode() {
            cfg.timeout_ms = Some(GRAMMAR_TIMEOUT_MS);
        }
        Ok(cfg)
    }

    /// the testable core of `parse_args`
    pub fn from_arg_list(args: &[String]) -> Result<Config, Box<dyn std::error::Error>> {
        let mut cfg = Config::defaults();

        if args.iter().any(|a| a == "-h" || a == "--help") {
            println!("{}", Config::help());
            std::process::exit(0);
        }

        let mut i = 1;
        while i < args.len() {
            let arg = args[i].as_str();
            let value = |i: &mut usize| -> Result<String, Box<dyn std::error::Error>> {
                *i += 1;
                args.get(*i)
                    .cloned()
                    .ok_or_else(|| format!("missing value for {}", arg).into())
            };
            match arg {
                "-t" | "--target" => cfg.target = PathBuf::from(value(&mut i)?),
                "-a" | "--arg" => cfg.target_args.push(value(&mut i)?),
                "-g" | "--grammar" => cfg.grammar = Some(PathBuf::from(value(&mut i)?)),
                "-x" | "--cc" => cfg.cc_path = PathBuf::from(value(&mut i)?),
                "--asm-out" => cfg.asm_out = PathBuf::from(value(&mut i)?),
                "--output-dir" => cfg.output_dir = PathBuf::from(value(&mut i)?),
                "-e" | "--ext" => cfg.ext = value(&mut i)?,
                "--timeout" => cfg.timeout_ms = Some(value(&mut i)?.parse()?),
                "-s" | "--seed" => cfg.seed = Some(value(&mut i)?.parse()?),
                "--ignore-ice" => cfg.ignore_ice.push(value(&mut i)?),
                "-p" | "--plaintext" => cfg.plaintext = true,
                unknown => {
                    eprintln!("\x1b[91mWarning\x1b[0m: unknown argument {}", unknown);
                }
            }
            i += 1;
        }
        Ok(cfg)
    }
}
