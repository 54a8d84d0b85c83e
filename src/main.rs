fn main() {
    if let Err(e) = progfuzz::begin() {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}
