fn main() {
    if let Err(e) = refscope_cli::run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
