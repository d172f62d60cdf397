//! Example: talk to a character through the microphone.
//!
//! Needs ANTHROPIC_API_KEY and/or OPENAI_API_KEY; ELEVENLABS_API_KEY to hear replies.
//!
//!     cargo run -p voicedebate-engine --example debate_loop -- Aristotle

use tracing::info;
use tracing_subscriber::EnvFilter;
use voicedebate_engine::{CharacterStore, ConversationOrchestrator, EngineConfig, EngineContext, OrchestratorEvent, ProviderKeys};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let character = std::env::args().nth(1).unwrap_or_else(|| "Socrates".to_string());
    let ctx = EngineContext::with_builtin_characters(EngineConfig::from_env(), &ProviderKeys::from_env());
    info!("Characters: {:?}", ctx.characters.names());

    let (handle, task) = ConversationOrchestrator::spawn(ctx);
    let mut events = handle.subscribe();
    handle.select_character(&character).await?;
    info!("✅ Speak to {}. Press Ctrl+C to stop.", character);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(OrchestratorEvent::Transcript(snapshot)) => info!("📝 {}", snapshot.display()),
                Ok(OrchestratorEvent::UserTurn(text)) => info!("🗣️ You: {}", text),
                Ok(OrchestratorEvent::AssistantTurn { character, text, .. }) => info!("🎭 {}: {}", character, text),
                Ok(OrchestratorEvent::StateChanged(state)) => info!("State: {:?}", state),
                Ok(OrchestratorEvent::Error(e)) => info!("⚠️ {}", e),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => info!("Skipped {} events", n),
                Err(_) => break,
            },
        }
    }

    handle.shutdown().await?;
    task.await?;
    Ok(())
}
