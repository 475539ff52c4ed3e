/// CareLink messaging demo - replays the core patient/provider scenarios
use carelink_core::{Config, Identity, MessengerApi, Session};
use std::env;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let api = MessengerApi::open(&config).map_err(|e| anyhow::anyhow!("Store error: {}", e))?;
    info!("Starting CareLink messaging demo");
    info!("   Root path: {}", config.root_path);

    let p1 = Identity::patient("patient-1", "Asha");
    let h1 = Identity::provider("hospital-1", "City Maternity Hospital");
    let patient = Session::authenticated(p1.clone());
    let provider = Session::authenticated(h1.clone());

    // 1. First contact creates the conversation
    let hello = api
        .send(&patient, &h1, "Hello")
        .map_err(|e| anyhow::anyhow!("Send failed: {}", e))?;
    let conversation_id = hello.conversation_id.clone();
    for conversation in api.conversations(&provider)? {
        info!(
            "{} sees {}: {}",
            h1.display_name,
            conversation
                .counterpart_of(&h1.id)
                .map(|(_, name)| name)
                .unwrap_or("?"),
            conversation.preview_for(&h1.id).unwrap_or_default()
        );
    }

    // 2. Follow-up lands in the same conversation
    api.send(&patient, &h1, "How are you")
        .map_err(|e| anyhow::anyhow!("Send failed: {}", e))?;
    let history = api.history(&patient, &conversation_id)?;
    info!("History of {} has {} messages", conversation_id, history.len());

    // 3. Both sides opening at once converge on one record
    let (a, b) = tokio::join!(
        {
            let api = api.clone();
            let patient = patient.clone();
            let h1 = h1.clone();
            tokio::task::spawn_blocking(move || api.open_conversation(&patient, &h1))
        },
        {
            let api = api.clone();
            let provider = provider.clone();
            let p1 = p1.clone();
            tokio::task::spawn_blocking(move || api.open_conversation(&provider, &p1))
        }
    );
    let (a, b) = (a??, b??);
    info!("Simultaneous open: {} / {} (same: {})", a.id, b.id, a.id == b.id);

    // 4. A viewer drops off, misses a message, and comes back
    let viewer = api.subscribe(&provider, &conversation_id)?;
    viewer.unsubscribe();
    api.send(&patient, &h1, "Sent while you were away")?;

    let mut viewer = api.subscribe(&provider, &conversation_id)?;
    let expected = api.history(&provider, &conversation_id)?.len();
    for _ in 0..expected {
        match timeout(Duration::from_secs(2), viewer.next()).await {
            Ok(Some(Ok(message))) => info!("  [{}] {}: {}", message.id, message.sender_id, message.text),
            Ok(Some(Err(e))) => warn!("Subscription problem: {}", e),
            Ok(None) | Err(_) => {
                warn!("Viewer stopped receiving ({})", viewer.status());
                break;
            }
        }
    }
    viewer.unsubscribe();

    info!(
        "Unread for {}: {}",
        h1.display_name,
        api.unread_count(&provider, &conversation_id)?
    );
    Ok(())
}
