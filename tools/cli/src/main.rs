//! imghost CLI - Command line interface for providers and images.
//!
//! This tool manages a user's storage providers and drives image uploads
//! through the same catalog a hosting service would use.

mod input;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use imghost_catalog::{
    Catalog, CreateProvider, ImageRecord, ProviderInfo, ProviderUpdate, UploadRequest,
};
use imghost_common::settings::ENCRYPTION_KEY_ENV;
use imghost_common::{ImageId, ProviderId, Settings, UserId};
use imghost_crypto::VaultKey;

#[derive(Parser)]
#[command(name = "imghost")]
#[command(about = "imghost - Multi-provider image hosting")]
#[command(version)]
struct Cli {
    /// Settings file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding settings and environment.
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Acting user id.
    #[arg(short, long, global = true, default_value_t = 1)]
    user: i64,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a credential encryption key.
    Keygen,

    /// Manage storage providers.
    #[command(subcommand)]
    Provider(ProviderCommand),

    /// Upload and manage images.
    #[command(subcommand)]
    Image(ImageCommand),
}

#[derive(Args)]
struct SecretArgs {
    /// Provider config entry (repeatable).
    #[arg(long, value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Provider config as a JSON object.
    #[arg(long, value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Credential entry (repeatable).
    #[arg(long, value_name = "KEY=VALUE")]
    secret: Vec<String>,

    /// Credentials as a JSON object.
    #[arg(long, value_name = "FILE")]
    credentials_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ProviderCommand {
    /// Register a provider.
    Add {
        /// Display name, unique per user.
        #[arg(short, long)]
        name: String,

        /// Provider type: s3, azure, gcs, or sftp.
        #[arg(short = 't', long = "type")]
        provider_type: String,

        /// Make this the default provider.
        #[arg(long)]
        default: bool,

        /// Register the provider as inactive.
        #[arg(long)]
        inactive: bool,

        #[command(flatten)]
        secrets: SecretArgs,
    },

    /// List providers.
    List {
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show one provider.
    Show { id: i64 },

    /// Change a provider.
    Update {
        id: i64,

        /// New display name.
        #[arg(short, long)]
        name: Option<String>,

        /// Set or clear the default flag.
        #[arg(long)]
        default: Option<bool>,

        /// Set or clear the active flag.
        #[arg(long)]
        active: Option<bool>,

        #[command(flatten)]
        secrets: SecretArgs,
    },

    /// Remove a provider with no images.
    Remove { id: i64 },

    /// Make a provider the default.
    SetDefault { id: i64 },

    /// Check that a provider is reachable.
    Test { id: i64 },
}

#[derive(Subcommand)]
enum ImageCommand {
    /// Upload an image.
    Upload {
        /// Image file.
        file: PathBuf,

        /// Provider id (default: the default provider).
        #[arg(short, long)]
        provider: Option<i64>,

        /// Content type (default: guessed from the extension).
        #[arg(long)]
        content_type: Option<String>,

        /// Store the file as is.
        #[arg(long)]
        no_optimize: bool,

        /// Tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// List images, newest first.
    List {
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show one image and its URL.
    Show { id: i64 },

    /// Download an image.
    Fetch {
        id: i64,

        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Delete an image.
    Remove { id: i64 },

    /// Show usage totals.
    Stats,

    /// Replace an image's tags.
    Tag {
        id: i64,

        /// Tag (repeatable; none clears all tags).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let user = UserId(cli.user);
    match cli.command {
        Commands::Keygen => cmd_keygen(),
        Commands::Provider(command) => {
            let catalog = open_catalog(cli.config.as_deref(), cli.database)?;
            run_provider(&catalog, user, command).await
        }
        Commands::Image(command) => {
            let catalog = open_catalog(cli.config.as_deref(), cli.database)?;
            run_image(&catalog, user, command).await
        }
    }
}

/// Load settings and open the catalog.
fn open_catalog(config: Option<&Path>, database: Option<PathBuf>) -> Result<Catalog> {
    let mut settings = Settings::load(config).context("Failed to load settings")?;
    if let Some(database) = database {
        settings.database_path = database;
    }
    info!("Using database {}", settings.database_path.display());
    Catalog::open(&settings).context("Failed to open catalog")
}

/// Print a new encryption key.
fn cmd_keygen() -> Result<()> {
    let key = VaultKey::generate();
    println!("{}", key.to_base64().as_str());
    eprintln!(
        "Store this value in {}. Losing it makes stored credentials unreadable.",
        ENCRYPTION_KEY_ENV
    );
    Ok(())
}

fn print_provider(provider: &ProviderInfo) {
    let mut flags = Vec::new();
    if provider.is_default {
        flags.push("default");
    }
    if !provider.is_active {
        flags.push("inactive");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    };
    println!(
        "  {:>4}  {} ({}){}",
        provider.id, provider.name, provider.provider_type_display, flags
    );
}

fn print_image(image: &ImageRecord) {
    let dims = match (image.width, image.height) {
        (Some(w), Some(h)) => format!("{}x{}", w, h),
        _ => "?".to_string(),
    };
    println!(
        "  {:>4}  {}  {}  {:.2} MB  {}",
        image.id,
        image.original_filename,
        dims,
        image.size_mb(),
        image.storage_path
    );
}

async fn run_provider(catalog: &Catalog, user: UserId, command: ProviderCommand) -> Result<()> {
    let registry = &catalog.providers;
    match command {
        ProviderCommand::Add {
            name,
            provider_type,
            default,
            inactive,
            secrets,
        } => {
            let config = input::provider_config(secrets.config_file.as_deref(), &secrets.set)?;
            let credentials =
                input::credentials(secrets.credentials_file.as_deref(), &secrets.secret)?;
            let provider = registry
                .create(
                    user,
                    CreateProvider {
                        name,
                        provider_type,
                        config,
                        credentials,
                        is_default: default,
                        is_active: !inactive,
                    },
                )
                .context("Failed to add provider")?;
            println!("Provider added:");
            print_provider(&provider);
        }

        ProviderCommand::List { json } => {
            let providers = registry.list(user)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&providers)?);
            } else if providers.is_empty() {
                println!("No providers configured.");
            } else {
                println!("Providers:");
                providers.iter().for_each(print_provider);
            }
        }

        ProviderCommand::Show { id } => {
            let provider = registry.get(user, ProviderId(id))?;
            println!("{}", serde_json::to_string_pretty(&provider)?);
        }

        ProviderCommand::Update {
            id,
            name,
            default,
            active,
            secrets,
        } => {
            let config = if secrets.set.is_empty() && secrets.config_file.is_none() {
                None
            } else {
                Some(input::provider_config(
                    secrets.config_file.as_deref(),
                    &secrets.set,
                )?)
            };
            let credentials =
                input::credentials(secrets.credentials_file.as_deref(), &secrets.secret)?;
            let provider = registry
                .update(
                    user,
                    ProviderId(id),
                    ProviderUpdate {
                        name,
                        config,
                        credentials,
                        is_default: default,
                        is_active: active,
                    },
                )
                .context("Failed to update provider")?;
            println!("Provider updated:");
            print_provider(&provider);
        }

        ProviderCommand::Remove { id } => {
            registry
                .delete(user, ProviderId(id))
                .context("Failed to remove provider")?;
            println!("Provider removed: {}", id);
        }

        ProviderCommand::SetDefault { id } => {
            let provider = registry.set_default(user, ProviderId(id))?;
            println!("Default provider is now {} ({})", provider.name, provider.id);
        }

        ProviderCommand::Test { id } => {
            let report = registry.test_connection(user, ProviderId(id)).await?;
            println!("{}", report.message);
            if !report.success {
                anyhow::bail!("Provider {} is not reachable", id);
            }
        }
    }
    Ok(())
}

async fn run_image(catalog: &Catalog, user: UserId, command: ImageCommand) -> Result<()> {
    let service = &catalog.images;
    match command {
        ImageCommand::Upload {
            file,
            provider,
            content_type,
            no_optimize,
            tags,
        } => {
            let content_type = match content_type {
                Some(content_type) => content_type,
                None => input::guess_content_type(&file)
                    .map(String::from)
                    .context("Cannot guess content type; pass --content-type")?,
            };
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("Invalid file name")?
                .to_string();
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let image = service
                .upload(
                    user,
                    UploadRequest {
                        filename,
                        content_type,
                        data: Bytes::from(data),
                        provider_id: provider.map(ProviderId),
                        optimize: !no_optimize,
                        tags,
                    },
                )
                .await
                .context("Upload failed")?;

            println!("Image uploaded:");
            print_image(&image);
            if let Some(pct) = image.optimization_percentage {
                println!("  Optimized: {:.2}% smaller", pct);
            }
            println!("  URL: {}", service.url(user, image.id).await?);
        }

        ImageCommand::List { json } => {
            let images = service.list(user)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&images)?);
            } else if images.is_empty() {
                println!("No images.");
            } else {
                println!("Images:");
                images.iter().for_each(print_image);
            }
        }

        ImageCommand::Show { id } => {
            let image = service.get(user, ImageId(id))?;
            let url = service.url(user, image.id).await?;
            let mut value = serde_json::to_value(&image)?;
            value["url"] = serde_json::Value::String(url);
            println!("{}", serde_json::to_string_pretty(&value)?);
        }

        ImageCommand::Fetch { id, output } => {
            let data = service
                .download(user, ImageId(id))
                .await
                .context("Download failed")?;
            tokio::fs::write(&output, &data)
                .await
                .context("Failed to write output file")?;
            println!("Image saved: {} ({} bytes)", output.display(), data.len());
        }

        ImageCommand::Remove { id } => {
            service.delete(user, ImageId(id)).await?;
            println!("Image removed: {}", id);
        }

        ImageCommand::Stats => {
            let stats = service.stats(user)?;
            println!("Images:      {}", stats.total_images);
            println!("Total size:  {:.2} MB", stats.total_size_mb);
            println!("Optimized:   {}", stats.optimized_images);
            println!("Saved:       {:.2} MB", stats.total_saved_mb);
        }

        ImageCommand::Tag { id, tags } => {
            let image = service.update_tags(user, ImageId(id), tags)?;
            println!("Tags: {}", image.tags.join(", "));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_provider_add() {
        let cli = Cli::try_parse_from([
            "imghost", "--user", "3", "provider", "add", "-n", "photos", "-t", "s3", "--set",
            "bucket=b", "--secret", "access_key_id=a", "--secret", "secret_access_key=s",
            "--default",
        ])
        .unwrap();
        assert_eq!(cli.user, 3);
        match cli.command {
            Commands::Provider(ProviderCommand::Add {
                name,
                provider_type,
                default,
                secrets,
                ..
            }) => {
                assert_eq!(name, "photos");
                assert_eq!(provider_type, "s3");
                assert!(default);
                assert_eq!(secrets.set, vec!["bucket=b"]);
                assert_eq!(secrets.secret.len(), 2);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_parse_image_upload() {
        let cli = Cli::try_parse_from([
            "imghost", "image", "upload", "cat.png", "--tag", "pets", "--no-optimize", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Image(ImageCommand::Upload {
                file,
                no_optimize,
                tags,
                provider,
                ..
            }) => {
                assert_eq!(file, PathBuf::from("cat.png"));
                assert!(no_optimize);
                assert_eq!(tags, vec!["pets"]);
                assert_eq!(provider, None);
            }
            _ => panic!("wrong command"),
        }
    }
}
