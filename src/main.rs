use anyhow::{Context, Result};
use clap::Parser;
use livestate::prelude::*;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const FILE_BACKEND: &str = "json-files";

#[derive(Parser)]
#[command(name = "livestate")]
#[command(about = "Demo server pushing live entity state over Server-Sent Events")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,

    #[arg(long, default_value_t = 3000)]
    dispatch_timeout_ms: u64,

    #[arg(long, default_value_t = 15)]
    heartbeat_secs: u64,

    /// Persist the demo entities as JSON documents under this directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn counter(config: EntityConfig) -> Result<EntityType, StateError> {
    EntityType::builder("Counter")
        .field("count", FieldType::Int, json!(0))
        .config(config.auto_persist(true))
        .method(
            "increment",
            vec![FieldSpec::new("amount", FieldType::Int).with_default(json!(1))],
            |ctx| {
                let next = ctx
                    .get_i64("count")?
                    .checked_add(ctx.arg_i64("amount")?)
                    .ok_or_else(|| CommandError::validation("count would overflow"))?;
                ctx.set("count", next)?;
                Ok(Some(json!(next)))
            },
        )
        .method("reset", vec![], |ctx| {
            ctx.set("count", 0)?;
            Ok(None)
        })
        .build()
}

fn cart() -> Result<EntityType, StateError> {
    EntityType::builder("Cart")
        .scope(ScopeKind::Session)
        .field("items", FieldType::List(Box::new(FieldType::Text)), json!([]))
        .config(EntityConfig::new().ttl_seconds(1800).namespaced(true))
        .method(
            "add",
            vec![FieldSpec::new("item", FieldType::Text)],
            |ctx| {
                let item = ctx.arg_str("item")?.trim().to_string();
                if item.is_empty() {
                    return Err(CommandError::validation("item must not be empty"));
                }
                let mut items = ctx.get("items").cloned().unwrap_or_else(|| json!([]));
                if let Some(list) = items.as_array_mut() {
                    list.push(json!(item));
                }
                ctx.set("items", items)?;
                ctx.emit(
                    Fragment::new(format!("<li>{item}</li>"))
                        .selector("#cart")
                        .mode(MergeMode::Append),
                )?;
                Ok(None)
            },
        )
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = EngineConfig::new()
        .sweep_interval(Duration::from_secs(cli.sweep_interval_secs))
        .dispatch_timeout(Duration::from_millis(cli.dispatch_timeout_ms))
        .connection(
            ConnectionConfig::new()
                .heartbeat_interval(Duration::from_secs(cli.heartbeat_secs))
                .idle_timeout(Duration::from_secs(cli.heartbeat_secs * 4)),
        );

    let mut builder = LiveState::builder().config(config);
    let counter_config = match &cli.data_dir {
        Some(dir) => {
            let files = Arc::new(
                JsonFilePersistence::open(dir)
                    .await
                    .with_context(|| format!("opening data dir {}", dir.display()))?,
            );
            builder = builder
                .custom_backend(FILE_BACKEND, files.clone())
                .sweep_target(files);
            EntityConfig::new().custom_backend(FILE_BACKEND)
        }
        None => EntityConfig::new(),
    };

    let engine = Arc::new(
        builder
            .entity(counter(counter_config))
            .entity(cart())
            .build()
            .context("building engine")?,
    );
    engine.start().context("starting workers")?;

    let app = livestate::web::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    info!(addr = %cli.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving")?;

    engine.shutdown().await?;
    Ok(())
}
