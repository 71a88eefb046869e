mod config;

use std::cmp::Reverse;
use std::path::PathBuf;
use std::sync::Arc;

use cacheable::api::HttpTransport;
use cacheable::cache::{Cache, Entity};
use cacheable::query::{Expression, Filter, Op};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cacheable")]
#[command(about = "Inspect a REST API through the entity cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cacheable/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List the configured model types
  Types,
  /// Fetch one entity by id
  Get { type_name: String, id: u64 },
  /// Run a filtered query
  Query {
    type_name: String,
    /// Only objects related to Type:id (repeatable)
    #[arg(long, value_name = "TYPE:ID")]
    relevant: Vec<String>,
    /// Field predicate such as status=Draft or title~audit (repeatable)
    #[arg(long = "where", value_name = "PREDICATE")]
    predicates: Vec<String>,
    /// Maximum number of results
    #[arg(long)]
    limit: Option<u64>,
  },
}

/// Route logs to a daily file under the data directory. The guard flushes on drop.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
  let dir = dirs::data_dir()?.join("cacheable").join("logs");
  std::fs::create_dir_all(&dir).ok()?;

  let appender = tracing_appender::rolling::daily(dir, "cacheable.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::INFO.into())
    .with_env_var("CACHEABLE_LOG")
    .from_env_lossy();

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}

fn parse_relevant(raw: &str) -> Result<(String, u64)> {
  let (type_name, id) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Expected TYPE:ID, got {}", raw))?;
  let id = id
    .parse()
    .map_err(|e| eyre!("Invalid id in {}: {}", raw, e))?;
  Ok((type_name.to_string(), id))
}

const OPERATORS: [&str; 6] = ["!=", "!~", "=", "~", "<", ">"];

fn parse_predicate(raw: &str) -> Result<Expression> {
  // The leftmost operator splits; at one position "!=" beats "=".
  let (at, token) = OPERATORS
    .iter()
    .filter_map(|token| raw.find(*token).map(|at| (at, *token)))
    .min_by_key(|(at, token)| (*at, Reverse(token.len())))
    .ok_or_else(|| eyre!("Expected FIELD<op>VALUE, got {}", raw))?;
  let op = Op::parse(token).ok_or_else(|| eyre!("Unsupported operator {}", token))?;

  let field = raw[..at].trim();
  if field.is_empty() {
    return Err(eyre!("Missing field name in {}", raw));
  }
  Ok(Expression::field(field, op, raw[at + token.len()..].trim()))
}

fn render(cache: &Cache, entity: &Entity) -> Value {
  Value::Object(entity.to_payload(cache.codec()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging();

  let config = config::Config::load(args.config.as_deref())?;
  let transport = HttpTransport::new(&config.api.url, config::Config::get_api_token())?;
  let cache = Cache::new(Arc::new(transport), config.cache.clone());
  for model in config.models()? {
    cache.register_type(model);
  }

  let output = match args.command {
    Command::Types => json!(cache.types().names()),
    Command::Get { type_name, id } => {
      let entity = cache.find_one(&type_name, id).await?;
      render(&cache, &entity)
    }
    Command::Query {
      type_name,
      relevant,
      predicates,
      limit,
    } => {
      let mut filter = Filter::new();
      for raw in &relevant {
        let (related, id) = parse_relevant(raw)?;
        filter = filter.relevant_to(related, id);
      }
      for raw in &predicates {
        filter = filter.include(parse_predicate(raw)?);
      }
      if let Some(limit) = limit {
        filter = filter.limit(0, limit);
      }

      let result = cache.query(&type_name, filter).await?;
      json!({
        "total": result.total,
        "values": result.values.iter().map(|e| render(&cache, e)).collect::<Vec<_>>(),
      })
    }
  };

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}
