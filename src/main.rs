use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use labport::{AppState, ClientConfig, NmcliPlatform, PromptProfile, SessionEvent};

const USAGE: &str = "usage: labport [WIFI:...;; | http://host:port] [default|lab_protocol_guide|structured_data_extraction]";

#[tokio::main]
async fn main() -> Result<()> {
    labport::init_logging();

    let mut args = std::env::args().skip(1);
    let target = args.next();
    let profile = match args.next() {
        Some(name) => name.parse::<PromptProfile>()?,
        None => PromptProfile::Default,
    };

    let config = ClientConfig::from_env()?;
    let platform = Arc::new(NmcliPlatform::new(config.join_timeout));
    let mut app = AppState::new(config, platform, None).await?;

    let endpoint = match target.as_deref() {
        Some(code) if code.trim().to_ascii_uppercase().starts_with(labport::pairing::SCHEME_PREFIX) => {
            app.pair(code).await?
        }
        Some(url) => app.use_server_url(url).await?,
        None => app
            .restore_last_server()
            .await?
            .with_context(|| format!("No server given and none remembered\n{}", USAGE))?,
    };
    println!("Connected to {} ({} profile). /new, /profile <name>, /reconnect, /quit.", endpoint, profile);

    let (mut session, mut events) = app.open_session(None, profile).await?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::MessageUpdated { delta, .. } => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                SessionEvent::MessageFinalized(_) => println!(),
                SessionEvent::MessageFailed(message) => println!("\n[error] {}", message.content),
                SessionEvent::Rejected(reason) => println!("[not sent] {}", reason),
                _ => {}
            }
        }
    });

    // Ctrl-C stops the reply in progress instead of quitting.
    let stop = session.stop_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            stop.stop_all();
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/new" => {
                app.selector.clear_remote_history().await;
                session.start(None).await?;
                println!("Started a new conversation.");
            }
            "/reconnect" => println!("{:?}", app.selector.check_connection().await),
            command if command.starts_with("/profile ") => {
                match command["/profile ".len()..].trim().parse::<PromptProfile>() {
                    Ok(profile) => {
                        session.set_profile(profile).await?;
                        println!("Using the {} profile.", profile);
                    }
                    Err(e) => println!("{}", e),
                }
            }
            text => {
                // Rejections are already printed from the event stream.
                if let Err(e) = session.send(&app.selector, text, Vec::new()).await {
                    log::warn!("Message not sent: {}", e);
                }
            }
        }
    }

    drop(session);
    let _ = printer.await;
    app.shutdown().await;
    Ok(())
}
