use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use storyshelf::config::Config;
use storyshelf::remote::{ClientOptions, Disconnected, Gateway, RemoteClient, RemoteSource};
use storyshelf::storage::{Database, StorageError, Story};
use storyshelf::sync::{CacheSlots, EventBus, SyncEvent, SyncService};

/// Get the config directory path (~/.config/storyshelf/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("storyshelf"))
}

#[derive(Parser, Debug)]
#[command(name = "storyshelf", about = "Offline-first story library reader")]
struct Args {
    /// Print events and records as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh the library from the remote source
    Sync,
    /// Check connectivity, then sync if online
    Auto,
    /// Show connectivity and cache statistics
    Status,
    /// List cached categories
    Categories,
    /// List cached stories
    Stories {
        /// Only stories in this category
        #[arg(long, value_name = "ID", conflicts_with_all = ["uncategorized", "featured"])]
        category: Option<String>,
        /// Only stories without a known category
        #[arg(long, conflicts_with = "featured")]
        uncategorized: bool,
        /// Only featured stories
        #[arg(long)]
        featured: bool,
    },
    /// Print a cached story
    Story {
        id: String,
    },
    /// Print the about page
    About,
    /// Delete all cached data
    Reset,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode output"),
    }
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Started { message } => println!("{message}"),
        SyncEvent::Progress {
            step,
            total,
            message,
            progress,
        } => println!("[{step}/{total}] {message} ({progress}%)"),
        SyncEvent::Completed {
            updates_found,
            data,
        } => println!(
            "Sync complete: {} categories, {} stories{}",
            data.categories.len(),
            data.stories.len(),
            if *updates_found { "" } else { " (no updates)" }
        ),
        SyncEvent::Failed { message } => eprintln!("Sync failed: {message}"),
    }
}

fn print_story_line(story: &Story) {
    println!(
        "{:>5}  {:<36}  {}{}",
        story.idx,
        story.id,
        story.title,
        story
            .author
            .as_deref()
            .map(|a| format!(" ({a})"))
            .unwrap_or_default()
    );
}

fn build_remote(config: &Config) -> Result<Arc<dyn RemoteSource>> {
    let Some(url) = config.remote_url.as_deref() else {
        tracing::warn!("No remote_url configured, running from cache only");
        return Ok(Arc::new(Disconnected));
    };
    let client = RemoteClient::new(
        url,
        config.anon_key.clone().map(SecretString::from),
        ClientOptions {
            request_timeout: config.request_timeout(),
            probe_timeout: config.probe_timeout(),
        },
    )
    .with_context(|| format!("Invalid remote_url '{url}'"))?;
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let config = Config::load(&config_dir.join("config.toml"))
        .context("Failed to load configuration")?
        .with_env_overrides();
    tracing::debug!(?config, "Effective configuration");

    let db_path = config.database_path(&config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(StorageError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of storyshelf appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open cache database: {}", e)),
    };

    let gateway = Gateway::new(build_remote(&config)?, CacheSlots::new(Arc::new(db.clone())));
    let events = Arc::new(EventBus::new());
    let service = Arc::new(SyncService::new(gateway, events).with_timeout(config.sync_timeout()));

    let json = args.json;
    let succeeded = run(args.command, &service, &config, json).await?;
    db.close().await;

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute one command. `Ok(false)` means the command ran but its
/// outcome was a failure already reported to the user.
async fn run(
    command: Command,
    service: &Arc<SyncService>,
    config: &Config,
    json: bool,
) -> Result<bool> {
    let gateway = service.gateway();

    match command {
        Command::Sync | Command::Auto => {
            let failed = Arc::new(AtomicBool::new(false));
            let seen = Arc::clone(&failed);
            service.events().subscribe(move |event: &SyncEvent| {
                if matches!(event, SyncEvent::Failed { .. }) {
                    seen.store(true, Ordering::SeqCst);
                }
                if json {
                    print_json(event);
                } else {
                    print_event(event);
                }
            });
            // Failures were already printed by the listener
            match command {
                Command::Sync => Ok(service.manual_refresh().await.is_ok()),
                _ => {
                    service
                        .spawn_auto_sync()
                        .await
                        .context("Background sync task failed")?;
                    Ok(!failed.load(Ordering::SeqCst))
                }
            }
        }
        Command::Status => {
            let online = service.check_connectivity().await;
            let stats = service.get_database_stats().await;
            if json {
                #[derive(Serialize)]
                struct StatusLine<'a> {
                    online: bool,
                    #[serde(flatten)]
                    stats: &'a storyshelf::storage::DatabaseStats,
                }
                print_json(&StatusLine {
                    online,
                    stats: &stats,
                });
            } else {
                println!("Remote:      {}", if online { "online" } else { "offline" });
                println!("Categories:  {}", stats.categories_count);
                println!("Stories:     {}", stats.stories_count);
                match stats.last_sync {
                    Some(at) => println!("Last sync:   {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                    None => println!("Last sync:   never"),
                }
            }
            Ok(true)
        }
        Command::Categories => {
            let mut categories = gateway.read_cached_categories().await;
            categories.sort_by(|a, b| a.name.cmp(&b.name));
            for category in &categories {
                if json {
                    print_json(category);
                } else {
                    println!("{:<36}  {}", category.id, category.name);
                }
            }
            if categories.is_empty() && !json {
                println!("No categories cached. Run `storyshelf sync` first.");
            }
            Ok(true)
        }
        Command::Stories {
            category,
            uncategorized,
            featured,
        } => {
            let mut stories = if let Some(id) = category.as_deref() {
                gateway.read_stories_by_category(id).await
            } else if uncategorized {
                gateway.read_uncategorized_stories().await
            } else if featured {
                gateway.read_featured_stories(config.featured_every).await
            } else {
                gateway.read_cached_stories().await
            };
            stories.sort_by_key(|s| s.idx);
            for story in &stories {
                if json {
                    print_json(story);
                } else {
                    print_story_line(story);
                }
            }
            Ok(true)
        }
        Command::Story { id } => match gateway.read_story_by_id(&id).await {
            Some(story) => {
                if json {
                    print_json(&story);
                } else {
                    println!("{}", story.title);
                    if let Some(author) = &story.author {
                        println!("by {author}");
                    }
                    println!();
                    println!("{}", story.content);
                }
                Ok(true)
            }
            None => {
                eprintln!("No cached story with id '{id}'");
                Ok(false)
            }
        },
        Command::About => match gateway.fetch_static_page(config.about_page_idx).await {
            Ok(Some(page)) => {
                if json {
                    print_json(&serde_json::json!({ "content": page }));
                } else {
                    println!("{page}");
                }
                Ok(true)
            }
            Ok(None) => {
                eprintln!("About page not found");
                Ok(false)
            }
            Err(e) => {
                eprintln!("Could not load the about page: {e}");
                Ok(false)
            }
        },
        Command::Reset => {
            service
                .reset_local_data()
                .await
                .context("Failed to clear cached data")?;
            println!("Local data cleared.");
            Ok(true)
        }
    }
}
