use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "reck")]
#[command(about = "Checkpoint and restore Linux processes", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Checkpoint a running process into a file
    Dump {
        /// Process to checkpoint
        #[arg(value_parser = clap::value_parser!(i32).range(1..))]
        pid: i32,
        /// Checkpoint file to create
        path: PathBuf,
    },

    /// Print the block index of a checkpoint
    Inspect {
        path: PathBuf,

        /// Also print every region record
        #[arg(long)]
        regions: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Resume a checkpoint, replacing this process
    Restore { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dump() {
        let args = Args::try_parse_from(["reck", "dump", "1234", "/tmp/a.reck"]).unwrap();
        assert_eq!(
            args.command,
            Command::Dump {
                pid: 1234,
                path: "/tmp/a.reck".into()
            }
        );
    }

    #[test]
    fn test_parse_inspect_flags() {
        let args = Args::try_parse_from(["reck", "inspect", "--regions", "a.reck"]).unwrap();
        assert_eq!(
            args.command,
            Command::Inspect {
                path: "a.reck".into(),
                regions: true,
                json: false
            }
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Args::try_parse_from(["reck"]).is_err());
        assert!(Args::try_parse_from(["reck", "dump", "0", "a.reck"]).is_err());
        assert!(Args::try_parse_from(["reck", "dump", "abc", "a.reck"]).is_err());
        assert!(Args::try_parse_from(["reck", "restore"]).is_err());
    }

    #[test]
    fn test_command_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
