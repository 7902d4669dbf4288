use anyhow::Result;
use registry_mirror::server::{self, registry, settings::Settings};

#[derive(Debug, Clone, clap::Subcommand)]
pub enum BackendCommands {
    /// Start the registry mirror HTTP server
    Server,
    /// Check configuration for errors and unused options
    CheckConfig,
    /// Show where a registry path would be proxied to
    Resolve {
        /// Inbound request path, e.g. /v2/quay/coreos/etcd/manifests/latest
        path: String,
    },
}

pub async fn handle_backend_command(cmd: BackendCommands) -> Result<()> {
    match cmd {
        BackendCommands::Server => {
            let settings = Settings::new()?;
            server::run_server(settings).await
        }
        BackendCommands::CheckConfig => {
            println!("Checking registry mirror configuration...");
            match Settings::new() {
                Ok(settings) => {
                    println!("✓ Configuration is valid");
                    for (alias, upstream) in settings.org_registry().aliases() {
                        println!("  {} -> {}", alias, upstream);
                    }
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        BackendCommands::Resolve { path } => {
            let settings = Settings::new()?;
            let route = registry::resolve(&settings.org_registry(), &path);

            let org = if route.org.is_empty() {
                "(none)"
            } else {
                route.org.as_str()
            };
            println!("org:      {}", org);
            println!("upstream: {}", route.upstream);
            println!("path:     {}", route.path);
            Ok(())
        }
    }
}
