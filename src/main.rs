//! SfM API CLI
//!
//! Serves the reconstruction endpoint and inspects its configuration.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sfm_api::{build_runtime, registry::ConfFamily, run_server, Config};

#[derive(Parser)]
#[command(name = "sfm-api")]
#[command(about = "Structure-from-motion reconstruction over HTTP", long_about = None)]
struct Cli {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Tokio worker threads (default: number of CPUs)
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service (default if no command specified)
    Serve,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// List the configuration keys the service accepts
    ListConfs,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Serve) => {
            serve_command(cli.config, cli.bind, cli.workers)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config, cli.bind)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }

        Some(Commands::ListConfs) => {
            list_confs_command(cli.config)?;
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, bind: Option<String>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    // Apply overrides
    if let Some(bind) = bind {
        config.server.bind_addr = bind;
    }

    Ok(config)
}

fn serve_command(config_path: Option<PathBuf>, bind: Option<String>, workers: Option<usize>) -> Result<()> {
    let config = load_config(config_path, bind)?;
    config.validate()?;

    let runtime = build_runtime(workers)?;
    runtime.block_on(async { run_server(config).await })?;

    Ok(())
}

fn validate_command(config_path: Option<PathBuf>, bind: Option<String>) -> Result<()> {
    let config = load_config(config_path, bind)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn list_confs_command(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, None)?;
    let registry = config.build_registry();

    for family in [ConfFamily::Extractors, ConfFamily::Matchers] {
        println!("{} ({}):", family, registry.len(family));
        for key in registry.keys(family) {
            if let Some(conf) = registry.resolve(key, family) {
                println!("  {:<24} -> {}", key, conf.output);
            }
        }
    }

    println!("\nDefaults:");
    println!("  retrieval_conf_key = {}", config.defaults.retrieval_conf);
    println!("  feature_conf_key   = {}", config.defaults.feature_conf);
    println!("  matcher_conf_key   = {}", config.defaults.matcher_conf);
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# SfM API Configuration

# === SERVER: HTTP listener ===
server:
  bind_addr: "0.0.0.0:8000"

  # Largest accepted request body (all images together), in MiB
  max_upload_mb: 1024

  # Path of the reconstruction endpoint
  route: "/sfm"

# === WORKSPACE: Per-request scratch directories ===
workspace:
  # Parent directory (omit for the system temp dir)
  # root: "/var/tmp/sfm"
  prefix: "sfm-"

# === DEFAULTS: Conf keys used when a request omits them ===
defaults:
  retrieval_conf: "netvlad"
  feature_conf: "superpoint_aachen"
  matcher_conf: "superpoint+lightglue"

# === PIPELINE: Stage execution ===
pipeline:
  # Cap on retrieval candidates per image: num_matched = min(cap, images)
  max_num_matched: 5

  # Run local feature extraction concurrently with retrieval + pairing
  parallel_feature_extraction: false

  # Deadline per stage in seconds (omit to wait indefinitely)
  # stage_timeout_secs: 1800

  # rename: keep both uploads as name_1.ext, ... | reject: answer 400
  duplicate_filenames: rename

# === VISION: hloc subprocesses ===
vision:
  python: "python3"
  package: "hloc"
  # env:
  #   CUDA_VISIBLE_DEVICES: "0"

# === METRICS ===
metrics:
  # Log a metrics line periodically
  enable: true
  interval_secs: 60

# === REGISTRY: Extra stage configurations (optional) ===
# Keys listed here are added to, or replace, the built-in tables.

# registry:
#   extractors:
#     superpoint_large:
#       output: "feats-superpoint-n8192-r1600"
#       model: {name: "superpoint", nms_radius: 3, max_keypoints: 8192}
#       preprocessing: {grayscale: true, resize_max: 1600}
#   matchers: {}
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Serve
        let cli = Cli::try_parse_from(["sfm-api"]);
        assert!(cli.is_ok());
        let cli = cli.unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parse_with_config_and_bind() {
        let cli = Cli::try_parse_from(["sfm-api", "-c", "other.yaml", "--bind", "127.0.0.1:9000"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("other.yaml")));
        assert_eq!(cli.bind.as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn test_cli_parse_subcommands() {
        let cli = Cli::try_parse_from(["sfm-api", "validate", "-c", "test.json"]);
        assert!(matches!(cli.unwrap().command, Some(Commands::Validate)));

        let cli = Cli::try_parse_from(["sfm-api", "list-confs"]);
        assert!(matches!(cli.unwrap().command, Some(Commands::ListConfs)));
    }

    #[test]
    fn test_bind_override() {
        let config = load_config(None, Some("127.0.0.1:1234".to_string())).unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 1234);
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.route, "/sfm");
    }
}
