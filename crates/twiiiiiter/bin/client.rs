use std::io::Write;

use anyhow::Context;
use chrono::{DateTime, Local};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use twiiiiiter_client::{Client, ClientError, ServerEvent};
use twiiiiiter_protocol::v1::{
    DEFAULT_PORT, KickReason, LoginStatus, MESSAGE_LEN, ReceivedMessage, SubscribeResult,
    USERNAME_LEN,
};

#[derive(Debug, Parser)]
#[command(name = "client", about = "Interactive Twiiiiiter client")]
struct Args {
    /// Server address as host[:port].
    #[arg(default_value = "localhost")]
    server: String,
}

const HELP: &str = "\
Commands:
  P <text>   publish a twiiiiit
  S <user>   subscribe to a user
  U <user>   unsubscribe from a user
  L          list subscriptions
  H          show this help
  Q          quit";

fn with_default_port(server: &str) -> String {
    if server.parse::<std::net::SocketAddr>().is_ok() || server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:{DEFAULT_PORT}")
    }
}

fn prompt(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

fn show(msg: &ReceivedMessage) {
    let when = DateTime::from_timestamp_micros(msg.date)
        .map(|t| {
            t.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| msg.date.to_string());
    println!("[{when}] {}: {}", msg.author, msg.text);
}

fn describe_subscribe(result: SubscribeResult) -> &'static str {
    match result {
        SubscribeResult::Ok => "done",
        SubscribeResult::NotFound => "no such user",
        SubscribeResult::Unchanged => "nothing to change",
    }
}

fn describe_kick(reason: KickReason) -> &'static str {
    match reason {
        KickReason::Closing => "server is closing",
        KickReason::ProtocolError => "protocol error",
    }
}

async fn login(client: &Client, lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<bool> {
    loop {
        prompt("USER ID: ");
        let Some(line) = lines.next_line().await? else {
            return Ok(false);
        };

        match client.join_as(line.trim()).await {
            Ok(LoginStatus::Ok) => return Ok(true),
            Ok(LoginStatus::AlreadyUsed) => println!("That name is already in use."),
            Ok(LoginStatus::IllegalName) => println!("That name is not allowed."),
            Err(ClientError::Field(_)) => {
                println!("Names are at most {USERNAME_LEN} bytes.")
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Returns `false` when the user asked to quit.
async fn run_command(client: &Client, line: &str) -> anyhow::Result<bool> {
    let line = line.trim();
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };

    match cmd.to_ascii_uppercase().as_str() {
        "" => {}
        "P" => match client.publish(arg).await {
            Err(ClientError::Field(_)) => println!("Twiiiiits are at most {MESSAGE_LEN} bytes."),
            other => other?,
        },
        "S" => match client.subscribe_to(arg).await {
            Ok(result) => println!("subscribe {arg}: {}", describe_subscribe(result)),
            Err(ClientError::Field(_)) => println!("Names are at most {USERNAME_LEN} bytes."),
            Err(e) => return Err(e.into()),
        },
        "U" => match client.unsubscribe_from(arg).await {
            Ok(result) => println!("unsubscribe {arg}: {}", describe_subscribe(result)),
            Err(ClientError::Field(_)) => println!("Names are at most {USERNAME_LEN} bytes."),
            Err(e) => return Err(e.into()),
        },
        "L" => {
            let names = client.list_subscriptions().await?;
            if names.is_empty() {
                println!("(no subscriptions)");
            }
            for name in names {
                println!("  {name}");
            }
        }
        "H" => println!("{HELP}"),
        "Q" => return Ok(false),
        other => println!("unknown command {other:?}, H for help"),
    }

    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let addr = with_default_port(&args.server);

    let mut client = Client::connect(&addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    if !login(&client, &mut lines).await? {
        return Ok(());
    }
    println!("{HELP}");

    loop {
        tokio::select! {
            event = client.next_event() => match event {
                Some(ServerEvent::Message(msg)) => show(&msg),
                Some(ServerEvent::Kicked(reason)) => {
                    println!("Disconnected: {}", describe_kick(reason));
                    break;
                }
                None => {
                    println!("Connection closed.");
                    break;
                }
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_command(&client, &line).await? {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    Ok(())
}
