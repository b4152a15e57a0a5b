use clap::Parser;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// sandhive - launches and supervises Firecracker sandboxes on a worker node
#[derive(Debug, Parser)]
#[command(name = "sandhive", author, about, version, styles = styles::styles())]
pub struct SandhiveArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<SandhiveSubcommand>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum SandhiveSubcommand {
    /// Reclaim orphaned sandboxes, then serve the HTTP control plane
    #[command(name = "serve")]
    Serve {
        /// Port to listen on, overriding SANDHIVE_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print every name and address derived from a slot index
    #[command(name = "slot")]
    Slot {
        /// The slot index
        #[arg(value_name = "IDX")]
        idx: u32,
    },

    /// Tear down the network of a leaked slot and release its key
    #[command(name = "reclaim")]
    Reclaim {
        /// The slot index
        #[arg(long)]
        slot: u32,

        /// The sandbox that held the slot
        #[arg(long)]
        sandbox_id: String,
    },
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_are_consistent() {
        SandhiveArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_reclaim() -> anyhow::Result<()> {
        let args = SandhiveArgs::try_parse_from([
            "sandhive",
            "reclaim",
            "--slot",
            "42",
            "--sandbox-id",
            "s1",
            "-v",
        ])?;
        assert!(args.verbose);
        match args.subcommand {
            Some(SandhiveSubcommand::Reclaim { slot, sandbox_id }) => {
                assert_eq!(slot, 42);
                assert_eq!(sandbox_id, "s1");
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
        Ok(())
    }
}
