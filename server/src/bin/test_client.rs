//! Simulated device for exercising a running server by hand
//!
//! Joins as a display or as the controller, prints every frame it receives
//! and optionally drives the game: a controller can start a pattern, a
//! display can answer every color it is lit with a hit.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::{Command, Envelope, GameSettings, Pattern, Payload, Role};
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated controller or display device")]
struct Args {
    /// Server URL
    #[arg(short, long, default_value = "ws://127.0.0.1:3000")]
    url: String,

    /// Role to join as: master or client
    #[arg(short, long, default_value = "client")]
    role: String,

    /// Username to announce; the server generates one when omitted
    #[arg(short, long)]
    sender: Option<String>,

    /// As a display, report a hit this many milliseconds after lighting up
    #[arg(long)]
    auto_hit: Option<u64>,

    /// As the controller, start this pattern right after joining
    #[arg(long)]
    start: Option<String>,

    /// Comma separated colors used with --start
    #[arg(long, default_value = "red,green,blue", value_delimiter = ',')]
    colors: Vec<String>,

    /// Interval in milliseconds used with --start
    #[arg(long, default_value = "1000")]
    interval: u64,
}

fn parse_pattern(name: &str) -> Result<Pattern, serde_json::Error> {
    serde_json::from_value(json!(name.to_lowercase()))
}

fn frame(kind: &str, content: Value, sender: &str) -> Message {
    Message::Text(json!({ "type": kind, "content": content, "sender": sender }).to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let role = Role::parse(&args.role)?;
    let start = args.start.as_deref().map(parse_pattern).transpose()?;

    println!("Connecting to {}", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str()).await?;
    let (mut sink, mut source) = ws_stream.split();

    let join = json!({
        "role": role.as_str(),
        "sender": args.sender.clone().unwrap_or_default(),
    });
    sink.send(Message::Text(join.to_string())).await?;
    println!("Joined as {}", role);

    let mut my_id: Option<String> = None;
    let label = args.sender.clone().unwrap_or_else(|| role.to_string());

    while let Some(message) = source.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(reason) => {
                println!("Server closed the connection: {:?}", reason);
                break;
            }
            _ => continue,
        };

        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                println!("Undecodable frame ({}): {}", e, text);
                continue;
            }
        };
        println!("[{}] {:?}", envelope.sender, envelope.payload);

        match envelope.payload {
            Payload::DeviceUpdate(assignment) => {
                println!("Assigned device id {}", assignment.id);
                my_id = Some(assignment.id);

                if let (Role::Controller, Some(pattern)) = (role, start) {
                    let settings = GameSettings {
                        interval_ms: args.interval,
                        pattern,
                        colors: args.colors.clone(),
                    };
                    let content = json!({
                        "action": "gameState",
                        "gameState": "running",
                        "settings": settings,
                    });
                    println!("Starting {:?} pattern", pattern);
                    sink.send(frame("command", content, &label)).await?;
                }
            }
            Payload::Command(Command::Color {
                color: Some(color), ..
            }) if role == Role::Display => {
                println!("Lit up {}", color);
                if let Some(delay) = args.auto_hit {
                    sleep(Duration::from_millis(delay)).await;
                    let content = json!({
                        "action": "hit",
                        "deviceId": my_id.clone(),
                        "hitSpeed": delay,
                        "timestamp": shared::now_millis(),
                    });
                    println!("Reporting hit after {} ms", delay);
                    sink.send(frame("hit", content, &label)).await?;
                }
            }
            Payload::Error(reason) => {
                println!("Server error: {}", reason);
            }
            _ => {}
        }
    }

    println!("Test client finished");
    Ok(())
}
