fn main() {
    if let Err(e) = streamwarden_lib::run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
