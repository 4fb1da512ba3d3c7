use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::serve::NextSuffixArgs;
use crate::config::serve::ServeArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the allocation coordinator HTTP service
    Serve(Box<ServeArgs>),
    /// Print the stack suffix that follows a given one
    #[command(name = "next-suffix")]
    NextSuffix(NextSuffixArgs),
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_next_suffix() {
        let cli = Cli::try_parse_from(["pool-coordinator", "next-suffix", "ZULU", "--max-segments", "2"])
            .expect("valid arguments");
        match cli.command {
            Commands::NextSuffix(args) => {
                assert_eq!(args.current, "ZULU");
                assert_eq!(args.max_segments, 2);
            }
            Commands::Serve(_) => panic!("expected next-suffix"),
        }
    }
}
