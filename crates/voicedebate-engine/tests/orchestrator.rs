//! Turn-taking behaviour of the conversation orchestrator, driven by scripted providers.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use voicedebate_engine::{
    ChatMessage, ConversationOrchestrator, ConversationState, OrchestratorEvent, PlaceholderTts, PlaybackOutcome,
    TranscriptEvent, TranscriptionMessage, VoiceError,
};

use ConversationState::*;

#[tokio::test(start_paused = true)]
async fn silence_ends_the_turn_and_the_reply_is_voiced() {
    init_tracing();
    let h = harness(
        vec![spoken("What is justice?")],
        Arc::new(FixedTts(vec![1, 2, 3])),
        Arc::new(InstantPlayer),
    );
    let (handle, task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();

    handle.select_character("Socrates").await.unwrap();

    let states = states_until(&mut events, Idle).await;
    assert_eq!(states, vec![Listening, Processing, Responding, Idle]);

    let states = states_until(&mut events, Listening).await;
    assert_eq!(states, vec![Listening]);
    assert_eq!(h.transcription.opens(), 2);

    let turns = h.logger.current_turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].speaker, "User");
    assert_eq!(turns[0].message, "What is justice?");
    assert_eq!(turns[1].speaker, "Socrates (claude-3-haiku-20240307)");
    assert_eq!(turns[1].message, "Echo: What is justice?");

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert_eq!(h.logger.finished().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_while_idle_changes_nothing() {
    init_tracing();
    let h = harness(vec![], Arc::new(PlaceholderTts), Arc::new(InstantPlayer));
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();

    handle.stop().await.unwrap();
    handle.stop().await.unwrap();

    assert_eq!(handle.current_state(), Idle);
    assert!(events.try_recv().is_err());
    assert_eq!(h.transcription.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn history_gains_two_messages_per_turn() {
    init_tracing();
    let h = harness(
        vec![spoken("one"), spoken("two"), spoken("three")],
        Arc::new(FixedTts(vec![0; 8])),
        Arc::new(InstantPlayer),
    );
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Aristotle").await.unwrap();

    for _ in 0..3 {
        next_matching(&mut events, |e| matches!(e, OrchestratorEvent::AssistantTurn { .. })).await;
    }

    let history = handle.history().await.unwrap();
    assert_eq!(history.len(), 6);
    assert_eq!(history[4], ChatMessage::user("three"));
    assert_eq!(history[5], ChatMessage::assistant("Echo: three"));

    // The third request carried the first two exchanges.
    let requests = h.llm.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].messages.len(), 1 + 4 + 1);

    handle.reset_history().await.unwrap();
    assert!(handle.history().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_synthesis_skips_playback_then_restarts_after_delay() {
    init_tracing();
    let h = harness(vec![spoken("Hello")], Arc::new(PlaceholderTts), Arc::new(InstantPlayer));
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();

    let finished = next_matching(&mut events, |e| matches!(e, OrchestratorEvent::PlaybackFinished { .. })).await;
    assert!(matches!(
        finished,
        OrchestratorEvent::PlaybackFinished {
            outcome: PlaybackOutcome::Skipped,
            ..
        }
    ));

    states_until(&mut events, Idle).await;
    let idle_at = tokio::time::Instant::now();
    states_until(&mut events, Listening).await;
    assert!(idle_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(h.transcription.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn playback_finishing_after_stop_is_ignored() {
    init_tracing();
    let player = Arc::new(GatedPlayer::default());
    let h = harness(vec![spoken("Hello")], Arc::new(FixedTts(vec![9; 4])), player.clone());
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();

    player.started.notified().await;
    assert_eq!(handle.current_state(), Responding);
    handle.stop().await.unwrap();
    assert_eq!(handle.current_state(), Idle);

    player.gate.notify_one();
    next_matching(&mut events, |e| matches!(e, OrchestratorEvent::PlaybackFinished { .. })).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.current_state(), Idle);
    assert_eq!(h.transcription.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn transcription_error_discards_the_turn() {
    init_tracing();
    let h = harness(
        vec![vec![
            TranscriptionMessage::Event(TranscriptEvent::final_text("Hello")),
            TranscriptionMessage::Error("microphone unplugged".to_string()),
        ]],
        Arc::new(FixedTts(vec![1])),
        Arc::new(InstantPlayer),
    );
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();

    let error = next_matching(&mut events, |e| matches!(e, OrchestratorEvent::Error(_))).await;
    assert!(matches!(error, OrchestratorEvent::Error(msg) if msg.contains("microphone unplugged")));
    states_until(&mut events, Idle).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.current_state(), Idle);
    assert_eq!(h.llm.calls(), 0);
    assert_eq!(h.transcription.opens(), 1);
    assert!(h.logger.current_turns().is_empty());
}

#[tokio::test(start_paused = true)]
async fn end_turn_answers_what_was_said_so_far() {
    init_tracing();
    let h = harness(
        vec![vec![TranscriptionMessage::Event(TranscriptEvent::final_text(
            "Is virtue teachable?",
        ))]],
        Arc::new(FixedTts(vec![1])),
        Arc::new(InstantPlayer),
    );
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();

    handle.end_turn().await.unwrap();
    let user = next_matching(&mut events, |e| matches!(e, OrchestratorEvent::UserTurn(_))).await;
    assert!(matches!(user, OrchestratorEvent::UserTurn(text) if text == "Is virtue teachable?"));
}

#[tokio::test(start_paused = true)]
async fn unknown_character_is_rejected() {
    init_tracing();
    let h = harness(vec![], Arc::new(PlaceholderTts), Arc::new(InstantPlayer));
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());

    let result = handle.select_character("Plato").await;
    assert!(matches!(result, Err(VoiceError::CharacterNotFound(name)) if name == "Plato"));
    assert_eq!(handle.current_state(), Idle);

    let result = handle.start().await;
    assert!(matches!(result, Err(VoiceError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn switching_character_starts_a_fresh_conversation() {
    init_tracing();
    let h = harness(
        vec![spoken("Hello"), vec![], vec![]],
        Arc::new(FixedTts(vec![1])),
        Arc::new(InstantPlayer),
    );
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();
    next_matching(&mut events, |e| matches!(e, OrchestratorEvent::AssistantTurn { .. })).await;
    assert_eq!(handle.history().await.unwrap().len(), 2);

    handle.select_character("Aristotle").await.unwrap();
    assert_eq!(handle.current_state(), Listening);
    assert!(handle.history().await.unwrap().is_empty());
    assert_eq!(h.logger.current_character().as_deref(), Some("Aristotle"));
    assert_eq!(h.logger.finished()[0].character, "Socrates");
}

fn gated(h: &mut Harness) -> Arc<GatedLlm> {
    let llm = Arc::new(GatedLlm::default());
    h.ctx.llms.register("claude", llm.clone());
    llm
}

fn assert_no_assistant_turn(events: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>) {
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, OrchestratorEvent::AssistantTurn { .. }),
            "unexpected reply: {:?}",
            event
        );
    }
}

#[tokio::test(start_paused = true)]
async fn stop_returns_while_the_transcription_flush_hangs() {
    init_tracing();
    let mut h = harness(vec![], Arc::new(PlaceholderTts), Arc::new(InstantPlayer));
    let transcription = Arc::new(HangingTranscription::default());
    h.ctx.transcription = transcription.clone();
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());

    handle.select_character("Socrates").await.unwrap();
    assert_eq!(handle.current_state(), Listening);

    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("stop waited on the transcription flush")
        .unwrap();
    assert_eq!(handle.current_state(), Idle);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transcription.aborts(), 1);

    // The orchestrator is still responsive.
    assert!(handle.history().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_during_restart_delay_cancels_the_restart() {
    init_tracing();
    let h = harness(
        vec![spoken("Hello"), spoken("unused")],
        Arc::new(FixedTts(vec![1])),
        Arc::new(InstantPlayer),
    );
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();

    let states = states_until(&mut events, Idle).await;
    assert_eq!(states, vec![Listening, Processing, Responding, Idle]);
    handle.stop().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.current_state(), Idle);
    assert_eq!(h.transcription.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn history_is_readable_while_a_reply_is_generated() {
    init_tracing();
    let mut h = harness(
        vec![spoken("one"), spoken("two")],
        Arc::new(FixedTts(vec![1])),
        Arc::new(InstantPlayer),
    );
    let llm = gated(&mut h);
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();

    llm.started.notified().await;
    assert!(handle.history().await.unwrap().is_empty());
    llm.gate.notify_one();
    next_matching(&mut events, |e| matches!(e, OrchestratorEvent::AssistantTurn { .. })).await;

    llm.started.notified().await;
    assert_eq!(handle.current_state(), Responding);
    assert_eq!(
        handle.history().await.unwrap(),
        vec![ChatMessage::user("one"), ChatMessage::assistant("Echo: one")]
    );

    handle.reset_history().await.unwrap();
    assert!(handle.history().await.unwrap().is_empty());

    llm.gate.notify_one();
    next_matching(&mut events, |e| matches!(e, OrchestratorEvent::AssistantTurn { .. })).await;
    assert_eq!(
        handle.history().await.unwrap(),
        vec![ChatMessage::user("two"), ChatMessage::assistant("Echo: two")]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_during_generation_discards_the_reply_and_keeps_the_generator() {
    init_tracing();
    let mut h = harness(
        vec![spoken("first"), spoken("second")],
        Arc::new(FixedTts(vec![1])),
        Arc::new(InstantPlayer),
    );
    let llm = gated(&mut h);
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();

    llm.started.notified().await;
    assert_eq!(handle.current_state(), Responding);
    handle.stop().await.unwrap();
    assert_eq!(handle.current_state(), Idle);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.current_state(), Idle);
    assert!(handle.history().await.unwrap().is_empty());
    assert_no_assistant_turn(&mut events);

    handle.start().await.unwrap();
    llm.started.notified().await;
    llm.gate.notify_one();
    let reply = next_matching(&mut events, |e| matches!(e, OrchestratorEvent::AssistantTurn { .. })).await;
    assert!(matches!(reply, OrchestratorEvent::AssistantTurn { text, .. } if text == "Echo: second"));

    let requests = llm.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 2);
    assert_eq!(
        handle.history().await.unwrap(),
        vec![ChatMessage::user("second"), ChatMessage::assistant("Echo: second")]
    );
}

#[tokio::test(start_paused = true)]
async fn reply_finishing_as_stop_arrives_is_not_recorded() {
    init_tracing();
    let mut h = harness(vec![spoken("Hello")], Arc::new(FixedTts(vec![1])), Arc::new(InstantPlayer));
    let llm = gated(&mut h);
    let (handle, _task) = ConversationOrchestrator::spawn(h.ctx.clone());
    let mut events = handle.subscribe();
    handle.select_character("Socrates").await.unwrap();

    llm.started.notified().await;
    llm.gate.notify_one();
    handle.stop().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.current_state(), Idle);
    assert!(handle.history().await.unwrap().is_empty());
    assert_no_assistant_turn(&mut events);
    assert_eq!(h.logger.current_turns().len(), 1);
}
