//! CLI argument definitions

use clap::Parser;
use framescope_common::DEFAULT_PORT;

#[derive(Parser)]
#[command(
    name = "framescope",
    about = "Headless viewer that receives frame telemetry from instrumented programs",
    after_help = "\
EXAMPLES:
    framescope                               Listen on the default port
    framescope --port 6000 --json            Print every frame as JSON
    framescope --duration 30                 Stop after 30 seconds"
)]
pub struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: String,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Print frames as JSON lines instead of text
    #[arg(long)]
    pub json: bool,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Only print connection events, not frames
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["framescope"]);
        assert_eq!(args.bind, "0.0.0.0");
        assert_eq!(args.port, DEFAULT_PORT);
        assert!(!args.json);
        assert_eq!(args.duration, 0);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from(["framescope", "--port", "6000", "--json", "-q"]);
        assert_eq!(args.port, 6000);
        assert!(args.json && args.quiet);
    }
}
