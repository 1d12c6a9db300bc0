use clap::Parser;

fn main() {
    let cli = fastgetctl::Cli::parse();
    if let Err(err) = fastgetctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
