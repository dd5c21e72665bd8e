// ABOUTME: Shared CLI arguments for hosting a link
// ABOUTME: Builds LinkConfig from flags and initializes tracing

use crate::link::LinkConfig;
use clap::Args;

/// Link tuning arguments
///
/// Use with `#[command(flatten)]` in a subcommand's Args struct.
#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    /// Capture ticks skipped between transmitted visualization frames
    #[arg(long, default_value = "0")]
    pub frames_to_skip: u32,

    /// Minimum spacing between accepted player commands in milliseconds
    #[arg(long, default_value = "50")]
    pub command_interval_ms: u64,

    /// Send idle waveforms unmodified while the player is paused
    #[arg(long)]
    pub no_blank: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl LinkArgs {
    /// Initialize tracing based on verbosity flag
    pub fn init_tracing(&self) {
        init_tracing(self.verbose);
    }

    /// Build LinkConfig from these args
    pub fn build_config(&self) -> LinkConfig {
        LinkConfig::new()
            .frames_to_skip(self.frames_to_skip)
            .command_interval_ms(self.command_interval_ms)
            .blank_idle_waveform(!self.no_blank)
    }
}

/// Install the fmt subscriber, honoring `RUST_LOG` when set
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose { "vizlink=debug" } else { "vizlink=info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        link: LinkArgs,
    }

    #[test]
    fn test_default_args() {
        let cli = TestCli::parse_from(["vizlink"]);
        assert_eq!(cli.link.frames_to_skip, 0);
        assert_eq!(cli.link.command_interval_ms, 50);
        assert!(!cli.link.no_blank);
        assert!(!cli.link.verbose);
    }

    #[test]
    fn test_build_config() {
        let cli = TestCli::parse_from([
            "vizlink",
            "--frames-to-skip",
            "2",
            "--command-interval-ms",
            "100",
            "--no-blank",
        ]);

        let config = cli.link.build_config();
        assert_eq!(config.frames_to_skip, 2);
        assert_eq!(config.command_interval_ms, 100);
        assert!(!config.blank_idle_waveform);
    }
}
