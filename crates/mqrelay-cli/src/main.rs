use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mqrelay::transport::{Gateway, ServerConfig, serve, shutdown_signal};
use mqrelay::config::parse_packet_size;
use mqrelay::{
    BrokerConfig, ChannelHandler, CorrelationWaiter, Envelope, Identity, MqttTransport, Relay,
    RelayConfig, ReplyInbox, TopicLayout, Uppercase, VersionInfo,
};

const USAGE: &str = "\
Usage: mqrelay <command> [options]

Commands:
  worker                 Transform every upload and publish the reply
  send <file>...         Send files and wait for the transformed copies
  serve                  Run the HTTP gateway

Common options:
  --broker <host:port>   Broker endpoint [default: $MQRELAY_BROKER or localhost:1883]
  --namespace <ns>       Topic namespace [default: arquivo]
  --max-packet-size <n>  MQTT packet limit in bytes [default: $MQRELAY_MAX_PACKET_SIZE or 16 MiB]

worker options:
  --prefix <p>           Prepended to reply names [default: CAPS_]
  --output-dir <dir>     Also save transformed files here

send options:
  --identity <id>        Reply identity [default: random]
  --timeout <secs>       Per-file timeout [default: 20]
  --output-dir <dir>     Where replies are saved [default: .]

serve options:
  --host <addr>          Bind address [default: 0.0.0.0]
  --port <port>          Bind port [default: 5000]
  --identity <id>        Gateway identity [default: random]
  --timeout <secs>       Default upload timeout [default: 5]";

#[derive(Debug, PartialEq)]
struct Common {
    broker: Option<String>,
    namespace: Option<String>,
    max_packet_size: Option<usize>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Worker {
        common: Common,
        prefix: Option<String>,
        output_dir: Option<PathBuf>,
    },
    Send {
        common: Common,
        files: Vec<PathBuf>,
        identity: Option<String>,
        timeout: Duration,
        output_dir: PathBuf,
    },
    Serve {
        common: Common,
        host: Option<String>,
        port: Option<u16>,
        identity: Option<String>,
        timeout: Option<Duration>,
    },
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start tokio runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(command)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("MQRELAY_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("mqrelay={level},mqrelay_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| format!("invalid timeout: {value}"))
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let subcommand = args.get(1).ok_or("missing command")?.as_str();
    if matches!(subcommand, "--help" | "-h" | "help") {
        return Err(String::new());
    }
    if !matches!(subcommand, "worker" | "send" | "serve") {
        return Err(format!("unknown command: {subcommand}"));
    }

    let mut common = Common {
        broker: None,
        namespace: None,
        max_packet_size: None,
    };
    let mut prefix = None;
    let mut output_dir: Option<PathBuf> = None;
    let mut identity = None;
    let mut timeout = None;
    let mut host = None;
    let mut port = None;
    let mut files = Vec::new();

    let mut i = 2;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || -> Result<String, String> {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match (subcommand, flag) {
            (_, "--help" | "-h") => return Err(String::new()),
            (_, "--broker") => common.broker = Some(value()?),
            (_, "--namespace") => common.namespace = Some(value()?),
            (_, "--max-packet-size") => {
                let raw = value()?;
                common.max_packet_size =
                    Some(parse_packet_size(&raw).map_err(|e| e.to_string())?);
            }
            ("worker", "--prefix") => prefix = Some(value()?),
            ("worker" | "send", "--output-dir") => output_dir = Some(PathBuf::from(value()?)),
            ("send" | "serve", "--identity") => identity = Some(value()?),
            ("send" | "serve", "--timeout") => timeout = Some(parse_timeout(&value()?)?),
            ("serve", "--host") => host = Some(value()?),
            ("serve", "--port") => {
                let raw = value()?;
                port = Some(raw.parse::<u16>().map_err(|_| format!("invalid port: {raw}"))?);
            }
            (_, arg) if arg.starts_with('-') => {
                return Err(format!("unknown flag for {subcommand}: {arg}"));
            }
            ("send", arg) => files.push(PathBuf::from(arg)),
            (_, arg) => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(match subcommand {
        "worker" => Command::Worker {
            common,
            prefix,
            output_dir,
        },
        "send" => {
            if files.is_empty() {
                return Err("send requires at least one file".to_string());
            }
            Command::Send {
                common,
                files,
                identity,
                timeout: timeout.unwrap_or(Duration::from_secs(20)),
                output_dir: output_dir.unwrap_or_else(|| PathBuf::from(".")),
            }
        }
        _ => Command::Serve {
            common,
            host,
            port,
            identity,
            timeout,
        },
    })
}

impl Common {
    fn broker_config(&self) -> anyhow::Result<BrokerConfig> {
        let mut config = BrokerConfig::from_env()?;
        if let Some(endpoint) = &self.broker {
            config = config.with_endpoint(endpoint)?;
        }
        if let Some(size) = self.max_packet_size {
            config.max_packet_size = size;
        }
        Ok(config)
    }

    fn layout(&self) -> TopicLayout {
        match &self.namespace {
            Some(namespace) => TopicLayout::new(namespace.clone()),
            None => TopicLayout::default(),
        }
    }
}

fn resolve_identity(identity: Option<String>) -> anyhow::Result<Identity> {
    Ok(match identity {
        Some(raw) => Identity::parse(&raw)?,
        None => Identity::allocate(),
    })
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Worker {
            common,
            prefix,
            output_dir,
        } => run_worker(common, prefix, output_dir).await,
        Command::Send {
            common,
            files,
            identity,
            timeout,
            output_dir,
        } => run_send(common, files, identity, timeout, &output_dir).await,
        Command::Serve {
            common,
            host,
            port,
            identity,
            timeout,
        } => run_serve(common, host, port, identity, timeout).await,
    }
}

async fn run_worker(
    common: Common,
    prefix: Option<String>,
    output_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let defaults = RelayConfig::default();
    let config = RelayConfig {
        prefix: prefix.unwrap_or(defaults.prefix),
        output_dir: output_dir.or(defaults.output_dir),
    };

    let broker = common
        .broker_config()?
        .with_client_id(format!("mqrelay-worker-{}", Identity::allocate()));
    let (handler, inbound) = ChannelHandler::channel();
    let transport = Arc::new(MqttTransport::connect(&broker, handler).await?);

    let mut relay = Relay::new(
        common.layout(),
        transport.clone(),
        Arc::new(Uppercase::new(config.prefix)),
    );
    if let Some(dir) = config.output_dir {
        relay = relay.with_output_dir(dir);
    }
    relay.start().await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal(cancel.clone()).await;
            cancel.cancel();
        }
    });

    let result = relay.run(inbound, cancel).await;
    transport.disconnect().await;
    result.context("relay stopped")
}

async fn run_send(
    common: Common,
    files: Vec<PathBuf>,
    identity: Option<String>,
    timeout: Duration,
    output_dir: &Path,
) -> anyhow::Result<()> {
    let identity = resolve_identity(identity)?;
    let layout = common.layout();
    let broker = common
        .broker_config()?
        .with_client_id(format!("mqrelay-send-{identity}"));

    let inbox = ReplyInbox::new(layout);
    let transport = Arc::new(MqttTransport::connect(&broker, inbox.clone()).await?);
    let waiter = CorrelationWaiter::new(inbox, transport.clone());
    waiter.open(&identity).await?;

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let mut failed = 0usize;
    for path in &files {
        let started = Instant::now();
        match send_one(&waiter, &identity, path, timeout, output_dir).await {
            Ok((saved, bytes, duration)) => {
                println!(
                    "{} -> {} ({} bytes, {:.2}s)",
                    path.display(),
                    saved.display(),
                    bytes,
                    duration.as_secs_f64()
                );
            }
            Err(e) => {
                failed += 1;
                println!(
                    "{} failed after {:.2}s: {e:#}",
                    path.display(),
                    started.elapsed().as_secs_f64()
                );
            }
        }
    }

    transport.disconnect().await;
    if failed > 0 {
        anyhow::bail!("{failed} of {} file(s) failed", files.len());
    }
    Ok(())
}

async fn send_one(
    waiter: &CorrelationWaiter,
    identity: &Identity,
    path: &Path,
    timeout: Duration,
    output_dir: &Path,
) -> anyhow::Result<(PathBuf, usize, Duration)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let record = waiter
        .request(identity, Envelope::new(name, content)?, timeout)
        .await?;

    let file_name = Path::new(&record.name)
        .file_name()
        .with_context(|| format!("reply name '{}' has no file component", record.name))?;
    let saved = output_dir.join(file_name);
    tokio::fs::write(&saved, &record.content)
        .await
        .with_context(|| format!("failed to write {}", saved.display()))?;

    Ok((saved, record.content.len(), record.duration))
}

async fn run_serve(
    common: Common,
    host: Option<String>,
    port: Option<u16>,
    identity: Option<String>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let identity = resolve_identity(identity)?;
    let broker = common
        .broker_config()?
        .with_client_id(format!("mqrelay-serve-{identity}"));

    let inbox = ReplyInbox::new(common.layout());
    let transport = Arc::new(MqttTransport::connect(&broker, inbox.clone()).await?);
    let waiter = Arc::new(CorrelationWaiter::new(inbox, transport.clone()));
    waiter.open(&identity).await?;

    let mut gateway = Gateway::new(waiter, identity)
        .with_version(VersionInfo::new().with_broker(transport.endpoint()));
    if let Some(timeout) = timeout {
        gateway = gateway.with_timeout(timeout);
    }

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        host: host.unwrap_or(defaults.host),
        port: port.unwrap_or(defaults.port),
    };

    let result = serve(config, Arc::new(gateway), CancellationToken::new()).await;
    transport.disconnect().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        std::iter::once("mqrelay")
            .chain(line.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn worker_defaults() {
        assert_eq!(
            parse_args(&args("worker")),
            Ok(Command::Worker {
                common: Common {
                    broker: None,
                    namespace: None,
                    max_packet_size: None,
                },
                prefix: None,
                output_dir: None,
            })
        );
    }

    #[test]
    fn send_collects_files_and_flags() {
        let command =
            parse_args(&args("send a.txt --timeout 1.5 b.txt --broker mq:1884 --identity alice"))
                .unwrap();
        assert_eq!(
            command,
            Command::Send {
                common: Common {
                    broker: Some("mq:1884".to_string()),
                    namespace: None,
                    max_packet_size: None,
                },
                files: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
                identity: Some("alice".to_string()),
                timeout: Duration::from_millis(1500),
                output_dir: PathBuf::from("."),
            }
        );
    }

    #[test]
    fn max_packet_size_applies_to_every_command() {
        let Ok(Command::Worker { common, .. }) =
            parse_args(&args("worker --max-packet-size 1048576"))
        else {
            panic!("expected worker");
        };
        assert_eq!(common.max_packet_size, Some(1_048_576));
        assert!(parse_args(&args("serve --max-packet-size 0")).is_err());
    }

    #[test]
    fn send_requires_files() {
        assert!(parse_args(&args("send --identity alice")).is_err());
    }

    #[test]
    fn serve_parses_port() {
        let Ok(Command::Serve { port, .. }) = parse_args(&args("serve --port 8080")) else {
            panic!("expected serve");
        };
        assert_eq!(port, Some(8080));
        assert!(parse_args(&args("serve --port http")).is_err());
    }

    #[test]
    fn flags_are_scoped_to_their_command() {
        assert_eq!(
            parse_args(&args("worker --port 1")),
            Err("unknown flag for worker: --port".to_string())
        );
        assert_eq!(
            parse_args(&args("serve --broker")),
            Err("--broker requires a value".to_string())
        );
    }

    #[test]
    fn rejects_bad_timeouts_and_commands() {
        assert!(parse_args(&args("send a --timeout -1")).is_err());
        assert!(parse_args(&args("send a --timeout soon")).is_err());
        assert_eq!(
            parse_args(&args("relay")),
            Err("unknown command: relay".to_string())
        );
        assert_eq!(parse_args(&args("--help")), Err(String::new()));
    }
}
