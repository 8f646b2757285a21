use clap::Parser;
use meshresponder::cli::{self, Cli, Command, ConfigCommand};
use meshresponder::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Version)) {
        cli::handle_version();
        return;
    }
    if matches!(cli.command, Some(Command::Config(ConfigCommand::Path))) {
        cli::handle_config_path(&cli);
        return;
    }

    let cfg = match cli::load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = logging::init_logging(&cfg.logging) {
        eprintln!("Warning: {}", e);
    }

    let result = match cli.command {
        None => cli::handle_serve(&cfg, true).await,
        Some(Command::Serve { no_watch }) => cli::handle_serve(&cfg, !no_watch).await,
        Some(Command::Check) => cli::handle_check(&cfg),
        Some(Command::Match { ref text }) => cli::handle_match(&cfg, text),
        Some(Command::Exec {
            ref text,
            ref from,
            no_spacing,
        }) => cli::handle_exec(&cfg, text, from, no_spacing).await,
        Some(Command::Scripts) => cli::handle_scripts(&cfg),
        Some(Command::Config(ConfigCommand::Show)) => cli::handle_config_show(&cfg),
        Some(Command::Config(ConfigCommand::Path)) | Some(Command::Version) => Ok(()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
