//! Joins a room and prints everything it receives; lines typed on stdin are
//! shared with the room, `/w <id> <text>` whispers and `/name <new>` renames.
//!
//! ```text
//! cargo run --example client -- ws://127.0.0.1:8080/ lobby secret alice
//! ```

use room_relay::client::{ClientConfig, ClientEvent, PubSubClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let url = Url::parse(&args.next().unwrap_or_else(|| "ws://127.0.0.1:8080/".into()))?;
    let room = args.next().unwrap_or_else(|| "lobby".into());
    let password = args.next().unwrap_or_else(|| "secret".into());
    let name = args.next().unwrap_or_else(|| "guest".into());

    let (client, mut events) = PubSubClient::connect(ClientConfig::new(url, room, password, name));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Message(message)) => println!("<< {:?}", message),
                Some(other) => println!("-- {:?}", other),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) if line.starts_with("/w ") => {
                    if let Some((to, text)) = line[3..].split_once(' ') {
                        client.whisper(to.into(), text);
                    }
                }
                Some(line) if line.starts_with("/name ") => client.change_name(&line[6..]),
                Some(line) => client.share(line),
                None => break,
            },
        }
    }

    client.close().await;
    Ok(())
}
