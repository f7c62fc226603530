//! Small subscriber CLI: connect to a broker, subscribe to destinations,
//! print every inbound frame until Ctrl-C.

use std::process::ExitCode;
use std::time::Duration;

use chrono::Local;
use clap::Parser;

use rhodium_stomp::{ConnectOptions, Connection, StompError, SubscribeOptions};

#[derive(Parser)]
#[command(name = "stomp")]
#[command(version)]
#[command(about = "Subscribe to STOMP destinations and print inbound frames")]
struct Cli {
    /// Broker host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Broker port
    #[arg(short = 'P', long, default_value_t = 61613)]
    port: u16,

    /// Login username
    #[arg(short, long, default_value = "guest")]
    login: String,

    /// Passcode
    #[arg(short, long, default_value = "guest")]
    passcode: String,

    /// Destinations to subscribe to (can be specified multiple times)
    #[arg(short, long, required = true)]
    subscribe: Vec<String>,

    /// Gzip-decode message bodies
    #[arg(long)]
    compressed: bool,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {}", error);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), StompError> {
    let options = ConnectOptions::new(&cli.host)
        .port(cli.port)
        .credentials(&cli.login, &cli.passcode)
        .timeout(Duration::from_secs(cli.timeout));
    let conn = Connection::connect(options).await?;

    for destination in &cli.subscribe {
        let id = conn
            .subscribe(
                destination,
                Vec::new(),
                SubscribeOptions {
                    compressed: cli.compressed,
                },
            )
            .await?;
        println!("subscribed to {} (id {})", destination, id);
    }
    conn.set_send_to_caller(true).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("disconnecting");
                conn.disconnect().await?;
                return Ok(());
            }
            message = conn.next_message() => match message {
                Some(message) => {
                    let stamp = Local::now().format("%H:%M:%S%.3f");
                    println!(
                        "[{}] {} {}",
                        stamp,
                        message.destination,
                        String::from_utf8_lossy(&message.frame.body).trim_end()
                    );
                }
                None => {
                    eprintln!("connection closed by broker");
                    return Ok(());
                }
            },
        }
    }
}
