//! Line-mode chat relay client
//!
//! Connects over TLS, trusting only the server's own certificate, prints
//! everything the server sends and forwards each stdin line.
//! Usage: chatrelay-client [--addr localhost:9000] [--ca tls/cert.pem] [-u name]

use anyhow::{Context, Result};
use chatrelay::chat::{tls, ClientCli};
use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ClientCli::parse();

    let connector = tls::connector(&cli.ca)?;
    let server_name = tls::server_name(&cli.server_name)?;

    let tcp = TcpStream::connect(&cli.addr)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.addr))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .context("TLS handshake failed")?;

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // The prompt has no trailing newline, so print raw chunks
    let read_task = tokio::spawn(async move {
        let mut buffer = vec![0u8; 4096];
        loop {
            match read_half.read(&mut buffer).await {
                Ok(0) => {
                    eprintln!();
                    eprintln!("Connection closed by server");
                    break;
                }
                Ok(n) => {
                    print!("{}", String::from_utf8_lossy(&buffer[..n]));
                    std::io::stdout().flush().ok();
                }
                Err(e) => {
                    eprintln!();
                    eprintln!("Error reading from server: {}", e);
                    break;
                }
            }
        }
    });

    if let Some(username) = &cli.username {
        write_half
            .write_all(format!("{}\n", username).as_bytes())
            .await
            .context("Failed to send username")?;
        write_half.flush().await?;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = write_half.write_all(format!("{}\n", line).as_bytes()).await {
                        eprintln!("Error sending message: {}", e);
                        break;
                    }
                    write_half.flush().await.ok();
                }
                Ok(None) => break,
                Err(e) => {
                    eprintln!("Error reading from stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }

        if read_task.is_finished() {
            break;
        }
    }

    write_half.shutdown().await.ok();
    read_task.abort();

    Ok(())
}
