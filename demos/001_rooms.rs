//! Room listing, room creation and push events.
//!
//! Demonstrates:
//! - Building a client and opening it with an app key and secret
//! - Listening for `update` and `delete` push events
//! - Reading and creating rooms
//! - Closing the client and draining the event stream
//!
//! Usage:
//!   FRANKLY_APP_KEY=... FRANKLY_APP_SECRET=... cargo run --example 001_rooms
//!   cargo run --example 001_rooms -- --debug
//!   cargo run --example 001_rooms -- --http

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use anyhow::Context;
use common::{Args, Credentials};
use frankly_client::{Client, ClientEvent, Request, Topic, Value};

// ============================================================================
// Main
// ============================================================================

fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run(&args) {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    println!("=== 001: Rooms ===\n");

    let credentials = Credentials::from_env()?;
    let url = if args.http {
        credentials
            .url
            .replacen("wss://", "https://", 1)
            .replacen("ws://", "http://", 1)
    } else {
        credentials.url.clone()
    };

    // ========================================================================
    // Open Client
    // ========================================================================

    println!("[1] Opening client...");
    println!("    URL: {url}");

    let client = Client::builder()
        .url(url)
        .request_timeout(Duration::from_secs(10))
        .build()?;
    let mut events = client.stream();

    client.on(Topic::Update, |event| {
        if let ClientEvent::Update(push) = event {
            println!("    [push] update {} {:?}", push.type_name(), push.path);
        }
    });
    client.on(Topic::Delete, |event| {
        if let ClientEvent::Delete(push) = event {
            println!("    [push] delete {} {:?}", push.type_name(), push.path);
        }
    });

    client
        .open_with_keys(
            credentials.app_key,
            credentials.app_secret,
            credentials.user_id,
            None,
        )
        .context("failed to open client")?;

    println!("    ✓ Client opened ({})\n", client.state());

    // ========================================================================
    // Read Rooms
    // ========================================================================

    println!("[2] Reading rooms...");

    let rooms = client.send(Request::read(["rooms"]).with_param("limit", 5))?;
    match &rooms {
        Value::Array(items) => println!("    ✓ {} room(s)\n", items.len()),
        other => println!("    ✓ {other}\n"),
    }

    // ========================================================================
    // Create Room
    // ========================================================================

    println!("[3] Creating room...");

    let payload = Value::Map(vec![
        (Value::from("title"), Value::from("demo room")),
        (Value::from("status"), Value::from("active")),
    ]);
    let room = client.create(["rooms"], payload)?;
    println!("    ✓ Created {room}\n");

    // ========================================================================
    // Close
    // ========================================================================

    println!("[4] Closing client...");

    client.close(1000, "demo finished");
    let topics: Vec<String> = events.by_ref().map(|e| e.topic().to_string()).collect();
    println!("    ✓ Events: {}", topics.join(", "));

    println!("\n=== Done ===");
    Ok(())
}
