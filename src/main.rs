use clap::Parser;
use update_builder::cli::{Args, Runner};
use update_builder::config::Environment;

const FAILURE_MARKER: &str = "failed to update builder";

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let runner = match Runner::new(&args, Environment::from_env()) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            eprintln!("{}", FAILURE_MARKER);
            std::process::exit(1);
        }
    };

    match runner.run().await {
        Ok(summary) if summary.is_success() => {}
        Ok(_) => {
            eprintln!("{}", FAILURE_MARKER);
            std::process::exit(1);
        }
        Err(e) => {
            runner.output().error(&e.to_string());
            eprintln!("{}", FAILURE_MARKER);
            std::process::exit(1);
        }
    }
}
