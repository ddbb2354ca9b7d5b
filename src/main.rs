fn main() {
    if let Err(e) = mic_boost_lib::run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
