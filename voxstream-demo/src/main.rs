mod cli;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first() {
        Some(path) => cli::play_file(path),
        None => cli::play_tones(),
    }
}
