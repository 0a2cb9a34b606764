fn main() {
    if let Err(e) = cephalon::run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
