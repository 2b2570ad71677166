fn main() {
    if let Err(err) = flowline::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
