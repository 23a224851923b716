use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use strata_engine::{
    EntitySchema, FieldRegistry, FieldType, FilterOp, LogStore, MemoryStore, Query, Strata,
    StrataConfig, TracingErrorSink,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "strata-cli")]
#[command(about = "Strata CLI - embedded cache engine over a persistent log", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Overrides store.data_dir from the configuration
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,

    /// Keep everything in memory instead of the on-disk log
    #[arg(long)]
    memory: bool,

    /// Queryable entity kind, e.g. `user=name:string,age:integer,city@address.city:string`
    #[arg(short = 'e', long = "entity")]
    entities: Vec<String>,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

struct StrataClient {
    engine: Strata,
    log: Option<Arc<LogStore>>,
}

impl StrataClient {
    async fn open(config: StrataConfig, registry: FieldRegistry, memory: bool) -> Result<Self> {
        if memory {
            let engine = Strata::with_parts(
                config,
                Arc::new(MemoryStore::new()),
                registry,
                Arc::new(TracingErrorSink),
            )?;
            return Ok(Self { engine, log: None });
        }

        let (engine, log) = Strata::open(config, registry)
            .await
            .context("failed to open the log store")?;
        Ok(Self {
            engine,
            log: Some(log),
        })
    }

    fn describe(&self) -> String {
        match &self.log {
            Some(log) => log.path().display().to_string(),
            None => "memory".to_string(),
        }
    }

    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_uppercase().as_str() {
            "GET" => self.cmd_get(args).await?,
            "FGET" => self.cmd_fget(args).await?,
            "SET" => self.cmd_set(args, false).await?,
            "SETD" => self.cmd_set(args, true).await?,
            "DEL" | "DELETE" => self.cmd_del(args, false).await?,
            "DELD" => self.cmd_del(args, true).await?,
            "QUERY" => self.cmd_query(args).await?,
            "PENDING" => self.cmd_pending(args)?,
            "FLUSH" => self.cmd_flush().await?,
            "COMPACT" => self.cmd_compact().await?,
            "INFO" | "STATS" => self.cmd_stats()?,
            "METRICS" => self.cmd_metrics()?,
            "KINDS" => self.cmd_kinds(),
            "HELP" => self.help_text(),
            _ => return Err(anyhow::anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn cmd_get(&self, args: &[String]) -> Result<String> {
        let key = single_key(args, "GET key")?;
        Ok(render_value(self.engine.get(key).await?))
    }

    async fn cmd_fget(&self, args: &[String]) -> Result<String> {
        let key = single_key(args, "FGET key")?;
        Ok(render_value(self.engine.force_consistent_read(key).await?))
    }

    async fn cmd_set(&self, args: &[String], durable: bool) -> Result<String> {
        if args.len() < 2 {
            return Err(anyhow::anyhow!("Usage: SET key value"));
        }

        let value = parse_value(&args[1..].join(" "));
        if durable {
            self.engine.set_durable(&args[0], value).await?;
        } else {
            self.engine.set(&args[0], value)?;
        }
        Ok("OK".green().to_string())
    }

    async fn cmd_del(&self, args: &[String], durable: bool) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: DEL key [key ...]"));
        }

        for key in args {
            if durable {
                self.engine.delete_durable(key).await?;
            } else {
                self.engine.delete(key)?;
            }
        }
        Ok(format!("(integer) {}", args.len()))
    }

    async fn cmd_query(&self, args: &[String]) -> Result<String> {
        let kind = args
            .first()
            .ok_or_else(|| anyhow::anyhow!("Usage: QUERY kind [field op value ...] [LIMIT n]"))?;

        let mut query = Query::kind(kind.as_str());
        let mut rest = &args[1..];
        while !rest.is_empty() {
            if rest[0].eq_ignore_ascii_case("LIMIT") {
                let limit = rest
                    .get(1)
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| anyhow::anyhow!("LIMIT expects a number"))?;
                query = query.limit(limit);
                rest = &rest[2..];
                continue;
            }
            if rest.len() < 3 {
                return Err(anyhow::anyhow!("incomplete condition: {}", rest.join(" ")));
            }
            let op = FilterOp::parse(&rest[1])
                .ok_or_else(|| anyhow::anyhow!("Unknown operator: {}", rest[1]))?;
            query = query.filter(&rest[0], op, parse_value(&rest[2]));
            rest = &rest[3..];
        }

        let rows = self.engine.query(&query).await?;
        if rows.is_empty() {
            return Ok("(empty list)".dimmed().to_string());
        }
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, (key, value))| format!("{}) {} {}", i + 1, key.bold(), value))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn cmd_pending(&self, args: &[String]) -> Result<String> {
        match args.first() {
            Some(key) => Ok(format!("(integer) {}", self.engine.is_pending(key) as u8)),
            None => Ok(format!(
                "(integer) {}",
                self.engine.stats().pending_write_count
            )),
        }
    }

    async fn cmd_flush(&self) -> Result<String> {
        self.engine.flush().await?;
        Ok("OK".green().to_string())
    }

    async fn cmd_compact(&self) -> Result<String> {
        let log = self
            .log
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("COMPACT needs the on-disk log store"))?;
        self.engine.flush().await?;
        let live = log.compact().await?;
        Ok(format!("OK ({} live records)", live).green().to_string())
    }

    fn cmd_stats(&self) -> Result<String> {
        let stats = self.engine.stats();
        let mut output = vec![
            format!("{}", "# Cache".bold()),
            format!("l1_hit_rate: {:.3}", stats.l1_hit_rate),
            format!("l2_hit_rate: {:.3}", stats.l2_hit_rate),
            format!("l1_entries: {}", stats.l1.entries),
            format!("l2_entries: {}", stats.l2.entries),
            String::new(),
            format!("{}", "# Writes".bold()),
            format!("pending_write_count: {}", stats.pending_write_count),
            format!("avg_flush_latency_ms: {:.2}", stats.avg_flush_latency_ms),
            format!("batch_threshold: {}", stats.scheduler.batch_threshold),
            format!("failed_writes: {}", stats.scheduler.failed),
            String::new(),
            format!("{}", "# Prefetch".bold()),
            format!("preload_accuracy: {:.3}", stats.preload_accuracy),
            format!("tracked_keys: {}", stats.tracker.tracked_keys),
        ];
        if let Some(preloader) = &stats.preloader {
            output.push(format!("prefetched: {}", preloader.loaded));
            output.push(format!("concurrency: {}", preloader.concurrency));
        }
        output.push(String::new());
        output.push(format!("{}", "# Raw".bold()));
        output.push(serde_json::to_string_pretty(&stats)?);
        Ok(output.join("\n"))
    }

    fn cmd_metrics(&self) -> Result<String> {
        strata_engine::metrics::encode_metrics().map_err(|e| anyhow::anyhow!(e))
    }

    fn cmd_kinds(&self) -> String {
        let kinds = self.engine.registry().kinds();
        if kinds.is_empty() {
            return "(empty list)".dimmed().to_string();
        }
        kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| format!("{}) \"{}\"", i + 1, kind))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn help_text(&self) -> String {
        format!(
            r#"{}

{}
  GET key                      Read through L1, L2 and the store
  FGET key                     Flush pending writes for key, then read the store
  SET key value                Write (value parsed as JSON, else a string)
  SETD key value               Write and wait until it is committed
  DEL key [key ...]            Delete one or more keys
  DELD key [key ...]           Delete and wait until committed

{}
  QUERY kind [field op value ...] [LIMIT n]
                               Filter committed entities; op is = != > >= < <= ~
  KINDS                        List queryable entity kinds

{}
  PENDING [key]                Buffered write count, or whether key is pending
  FLUSH                        Flush every buffered write
  COMPACT                      Rewrite the log with live records only

{}
  STATS                        Engine statistics
  METRICS                      Prometheus metrics
  HELP                         Show this help message
  QUIT                         Exit the CLI
"#,
            "Strata CLI - Available Commands".bold().cyan(),
            "Key Commands:".bold(),
            "Query Commands:".bold(),
            "Write Buffer:".bold(),
            "Engine Commands:".bold(),
        )
    }
}

fn single_key<'a>(args: &'a [String], usage: &str) -> Result<&'a str> {
    match args {
        [key] => Ok(key.as_str()),
        _ => Err(anyhow::anyhow!("Usage: {}", usage)),
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn render_value(value: Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => format!("\"{}\"", s),
        Some(other) => other.to_string(),
        None => "(nil)".dimmed().to_string(),
    }
}

/// Parse `kind=field:type,alias@path.to.field:type`
fn parse_entity(entity: &str) -> Result<EntitySchema> {
    let (kind, fields) = entity
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("entity must look like kind=field:type,..."))?;

    let mut builder = EntitySchema::builder(kind.trim());
    for field in fields.split(',').filter(|f| !f.trim().is_empty()) {
        let (name, ty) = field
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("field {} has no type", field))?;
        let ty = match ty.to_ascii_lowercase().as_str() {
            "string" | "str" => FieldType::String,
            "integer" | "int" => FieldType::Integer,
            "float" | "number" => FieldType::Float,
            "bool" | "boolean" => FieldType::Bool,
            "any" => FieldType::Any,
            other => return Err(anyhow::anyhow!("Unknown field type: {}", other)),
        };
        builder = match name.split_once('@') {
            Some((alias, path)) => builder.nested(alias, path, ty),
            None => builder.field(name, ty),
        };
    }
    Ok(builder.build()?)
}

fn init_logging(config: &StrataConfig) {
    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stdout)
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StrataConfig::from_file(path)?,
        None => StrataConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.store.data_dir = dir.clone();
    }
    init_logging(&config);

    let mut registry = FieldRegistry::new();
    for entity in &args.entities {
        registry.register(parse_entity(entity)?)?;
    }

    let client = StrataClient::open(config, registry, args.memory).await?;

    let result = if !args.command.is_empty() {
        // Command mode: execute single command and exit
        let cmd = &args.command[0];
        let cmd_args: Vec<String> = args.command[1..].to_vec();
        client.execute_command(cmd, &cmd_args).await.map(|output| {
            info!("{}", output);
        })
    } else {
        run_interactive(&client).await
    };

    client.engine.shutdown().await?;

    if let Err(e) = result {
        error!(error = %e, "{}", format!("Error: {}", e).red());
        std::process::exit(1);
    }
    Ok(())
}

async fn run_interactive(client: &StrataClient) -> Result<()> {
    info!(
        "{}",
        format!("Strata CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Store: {}", client.describe());
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;
    let prompt = format!("{}> ", "strata".green());

    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }

                rl.add_history_entry(&line)?;

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let cmd = &parts[0];
                let args = &parts[1..];

                if cmd.eq_ignore_ascii_case("QUIT") || cmd.eq_ignore_ascii_case("EXIT") {
                    info!("Goodbye!");
                    break;
                }

                match client.execute_command(cmd, args).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value_falls_back_to_string() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_value("hello world"), json!("hello world"));
    }

    #[test]
    fn test_parse_entity() {
        let schema = parse_entity("user=name:string,age:int,city@address.city:string").unwrap();
        assert_eq!(schema.kind(), "user");
        assert_eq!(
            schema.accessor("age").unwrap().field_type(),
            FieldType::Integer
        );
        let city = schema.accessor("city").unwrap();
        let doc = json!({"address": {"city": "Lisbon"}});
        assert_eq!(city.read(&doc), Some(&json!("Lisbon")));
    }

    #[test]
    fn test_parse_entity_rejects_bad_types() {
        assert!(parse_entity("user=name:text").is_err());
        assert!(parse_entity("user").is_err());
        assert!(parse_entity("user=name").is_err());
    }

    #[tokio::test]
    async fn test_commands_against_memory_engine() {
        let mut config = StrataConfig::default();
        config.preloader.enabled = false;
        let mut registry = FieldRegistry::new();
        registry.register(parse_entity("user=age:integer").unwrap()).unwrap();
        let client = StrataClient::open(config, registry, true).await.unwrap();

        let args = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        client
            .execute_command("set", &args(&["user:1", "{\"age\":", "30}"]))
            .await
            .unwrap();
        client
            .execute_command("SETD", &args(&["user:2", "{\"age\":20}"]))
            .await
            .unwrap();

        let out = client.execute_command("FGET", &args(&["user:1"])).await.unwrap();
        assert!(out.contains("\"age\":30"));

        let out = client
            .execute_command("QUERY", &args(&["user", "age", ">", "25"]))
            .await
            .unwrap();
        assert!(out.contains("user:1"));
        assert!(!out.contains("user:2"));

        assert!(client.execute_command("COMPACT", &[]).await.is_err());
        assert!(client.execute_command("NOPE", &[]).await.is_err());

        client.engine.shutdown().await.unwrap();
    }
}
