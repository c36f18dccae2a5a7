// Command handlers for the control center CLI

use crate::hub::bag::Resolution;
use crate::hub::cli::{ConnectArgs, HubCommand};
use crate::hub::client::{ClientHandle, HubClient};
use crate::hub::config::HubConfig;
use crate::hub::letter::Letter;
use crate::hub::server::HubServer;
use anyhow::{Context, Result};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::task::TaskTracker;

/// Execute a control center command
pub async fn execute_command(command: HubCommand) -> Result<()> {
    match command {
        HubCommand::Serve {
            config,
            host,
            port,
            key,
            acquire_bags,
            status_interval,
        } => handle_serve(config, host, port, key, acquire_bags, status_interval).await,
        HubCommand::Worker {
            connect,
            min_secs,
            max_secs,
        } => handle_worker(connect, min_secs, max_secs).await,
        HubCommand::Send {
            connect,
            dst,
            content,
            wait,
        } => handle_send(connect, dst, content, wait).await,
        HubCommand::Forward { connect, dst } => handle_forward(connect, dst).await,
    }
}

async fn handle_serve(
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    key: Option<String>,
    acquire_bags: bool,
    status_interval: Option<u64>,
) -> Result<()> {
    let mut config = match config {
        Some(path) => HubConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HubConfig::default(),
    };
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(key) = key {
        config.key = key;
    }
    if acquire_bags {
        config.acquire_bags = true;
    }
    if let Some(secs) = status_interval {
        config.status_interval_secs = secs;
    }

    let server = HubServer::start(config)
        .await
        .context("Failed to start control center")?;

    println!("✓ Control center listening on {}", server.local_addr());
    println!("  Station: {}", server.config().station_name);
    println!(
        "  Mail address: {}",
        server.config().hub_identity().address()
    );
    println!("\nPress Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    println!("\nStopping control center...");
    let clients = server.registry().len().await;
    server.shutdown().await;
    println!("✓ Stopped ({} clients dropped)", clients);

    Ok(())
}

async fn handle_worker(connect: ConnectArgs, min_secs: f64, max_secs: f64) -> Result<()> {
    if !(0.0..=max_secs).contains(&min_secs) {
        anyhow::bail!("Invalid work range {}..{} seconds", min_secs, max_secs);
    }

    let mut client = HubClient::connect(connect.client_config())
        .await
        .context("Failed to connect to control center")?;
    println!("✓ Worker {} ready", client.identity());

    let jobs = TaskTracker::new();
    loop {
        tokio::select! {
            letter = client.recv() => {
                let Some(letter) = letter else {
                    println!("Connection closed by control center");
                    break;
                };
                let work = Duration::from_secs_f64(rand::thread_rng().gen_range(min_secs..=max_secs));
                jobs.spawn(work_on(client.handle(), letter, work));
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping worker...");
                break;
            }
        }
    }

    jobs.close();
    jobs.wait().await;
    client.close().await;
    Ok(())
}

/// Hold the letter in pending for `work`, then answer its sender
async fn work_on(handle: ClientHandle, mut letter: Letter, work: Duration) {
    let address = handle.address();
    handle.mail().pass_letter(&mut letter, &address);
    handle.mail().bags().pending.insert_letter(&letter).await;
    tracing::info!(
        "Working on {} from {} for {:.2}s",
        letter.uid,
        letter.src,
        work.as_secs_f64()
    );

    tokio::time::sleep(work).await;

    let mut reply = letter.clone().reply(address);
    reply.timestamp = handle.now();
    match handle.send_letter(&reply).await {
        Ok(()) => {
            handle.mail().finish(&letter.uid).await;
            tracing::info!("Answered {} to {}", letter.uid, reply.dst);
        }
        Err(e) => {
            handle.mail().fail(&letter.uid, &e.to_string()).await;
            tracing::warn!("Could not answer {}: {}", letter.uid, e);
        }
    }
}

async fn handle_send(connect: ConnectArgs, dst: String, content: String, wait: bool) -> Result<()> {
    let client = HubClient::connect(connect.client_config())
        .await
        .context("Failed to connect to control center")?;

    if wait {
        let letter = client.request(&dst, &content).await?;
        println!("✓ Sent {} to {}, waiting for a response...", letter.uid, dst);
        match client.handle().settle(&letter.uid).await {
            Resolution::Finished => println!("✓ {} finished", letter.uid),
            Resolution::Failed => {
                let reason = client
                    .mail()
                    .bags()
                    .failed
                    .get(&letter.uid)
                    .await
                    .and_then(|slot| slot.into_letters().pop())
                    .and_then(|l| l.fail_reason)
                    .unwrap_or_default();
                println!("✗ {} failed: {}", letter.uid, reason);
            }
            Resolution::Absent => println!("? {} left no trace", letter.uid),
        }
    } else {
        let handle = client.handle();
        let letter = handle
            .mail()
            .mk_letter(&handle.address(), &dst, &content, Some(handle.now()))
            .await;
        client.send_letter(&letter).await?;
        println!("✓ Sent {} to {}", letter.uid, dst);
    }

    client.close().await;
    Ok(())
}

async fn handle_forward(connect: ConnectArgs, dst: String) -> Result<()> {
    let client = HubClient::connect(connect.client_config())
        .await
        .context("Failed to connect to control center")?;
    let handle = client.handle();
    println!("✓ Forwarding stdin lines to {} (Ctrl+D to stop)", dst);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut forwarded = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let mut letter = handle
            .mail()
            .mk_letter(&handle.address(), &dst, &line, Some(handle.now()))
            .await;
        handle.mail().pass_letter(&mut letter, "stdin");
        client.send_letter(&letter).await?;
        forwarded += 1;
    }

    println!("✓ Forwarded {} letters", forwarded);
    client.close().await;
    Ok(())
}
