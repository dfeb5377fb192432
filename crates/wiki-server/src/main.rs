use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wiki_core::{Wiki, WikiConfig};

mod api;
mod error;
mod server;

#[derive(Parser)]
#[command(version, about = "Multi-group wiki server")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, env = "WIKI_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration.
    #[arg(long, env = "WIKI_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        #[arg(long, default_value_t = 8080, env = "PORT")]
        port: u16,
    },

    /// Rebuild reference edges and search indexes from the stored pages.
    Reindex {
        /// Only this group. All configured groups when omitted.
        #[arg(long)]
        group: Option<String>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<WikiConfig> {
    let mut config = match &cli.config {
        Some(path) => WikiConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => WikiConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn reindex(wiki: &Wiki, only: Option<&str>) -> anyhow::Result<()> {
    let names: Vec<String> = match only {
        Some(name) => vec![name.to_string()],
        None => wiki.group_names().to_vec(),
    };
    for name in names {
        let group = wiki.group(&name)?;
        let summary = group.reindex()?;
        tracing::info!(
            group = %name,
            pages = summary.pages,
            relinked = summary.relinked,
            "Reindexed group"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        groups = ?config.groups,
        "Loaded configuration"
    );
    let wiki = Wiki::open(config)?;

    match cli.command {
        Command::Serve { host, port } => {
            wiki.open_all()?;
            let server = Arc::new(server::Server::new(wiki));
            server.serve(SocketAddr::new(host, port)).await?;
        }
        Command::Reindex { group } => {
            tokio::task::spawn_blocking(move || reindex(&wiki, group.as_deref())).await??;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wiki.toml");
        let text = "data_dir = \"/srv/wiki\"\ngroups = [\"main\", \"physics\"]\n";
        std::fs::write(&path, text).unwrap();

        let cli = Cli::parse_from([
            "wiki-server",
            "--config",
            path.to_str().unwrap(),
            "--data-dir",
            dir.path().to_str().unwrap(),
            "reindex",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.groups, vec!["main", "physics"]);
    }

    #[test]
    fn reindex_persisted_groups() {
        let dir = tempfile::tempdir().unwrap();
        let config = WikiConfig {
            data_dir: dir.path().to_path_buf(),
            groups: vec!["main".into(), "physics".into()],
            ..WikiConfig::default()
        };
        let wiki = Wiki::open(config).unwrap();
        wiki.group("main")
            .unwrap()
            .edit_page(wiki_core::HOME_PAGE_ID, 1, "orbital mechanics")
            .unwrap();

        reindex(&wiki, None).unwrap();
        let hits = wiki
            .group("main")
            .unwrap()
            .search(&wiki_core::SearchRequest {
                keyword: Some("orbital".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.total, 1);

        assert!(reindex(&wiki, Some("chemistry")).is_err());
    }
}
