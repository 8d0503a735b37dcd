//! Terminal-Client für Anrufe über den Signaling-Relay
//!
//! Befehle (eine Zeile pro Befehl):
//!   call <user-id> [video]   anrufen
//!   accept | reject          eingehenden Anruf annehmen/ablehnen
//!   hangup                   auflegen
//!   mute | unmute            Mikrofon
//!   video on|off             Kamera
//!   status                   aktuelle Session anzeigen
//!   quit

use anyhow::{bail, Context};
use pulse_calls::call_engine::{CallEvent, OutgoingCall};
use pulse_calls::config::ClientConfig;
use pulse_calls::crypto::KeyPair;
use pulse_calls::signaling::UserId;
use pulse_calls::CallClient;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pulse_calls::init_tracing();

    let config = ClientConfig::from_env().context("invalid client configuration")?;
    let keypair =
        KeyPair::load_or_create(config.key_path.as_deref()).context("failed to load keypair")?;

    let client = CallClient::connect(config, keypair)
        .await
        .context("failed to connect to signaling relay")?;
    println!("Connected as {}", client.user_id());

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.first() == Some(&"quit") {
            break;
        }
        if let Err(e) = run_command(&client, &words).await {
            println!("error: {e}");
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn run_command(client: &CallClient, words: &[&str]) -> anyhow::Result<()> {
    let engine = client.engine();
    match words {
        [] => {}
        ["call", user] => {
            engine.start_call(OutgoingCall::audio(UserId::new(*user))).await?;
        }
        ["call", user, "video"] => {
            engine.start_call(OutgoingCall::video(UserId::new(*user))).await?;
        }
        ["accept"] => engine.accept_call().await?,
        ["reject"] => engine.reject_call().await?,
        ["hangup"] => engine.hang_up().await?,
        ["mute"] => engine.set_audio_enabled(false)?,
        ["unmute"] => engine.set_audio_enabled(true)?,
        ["video", "on"] => engine.set_video_enabled(true)?,
        ["video", "off"] => engine.set_video_enabled(false)?,
        ["status"] => match engine.session() {
            Some(session) => println!(
                "{} with {} ({}), muted: {}",
                session.phase(),
                session.peer(),
                if session.is_video() { "video" } else { "audio" },
                engine.is_muted()
            ),
            None => println!("{}", engine.phase()),
        },
        other => bail!("unknown command: {}", other.join(" ")),
    }
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged(phase) => println!("[{phase}]"),
        CallEvent::IncomingCall {
            from,
            display_name,
            is_video,
            ..
        } => {
            let kind = if *is_video { "video" } else { "audio" };
            println!("Incoming {kind} call from {display_name} ({from}), type accept or reject");
        }
        CallEvent::RingStarted(direction) => println!("Ringing ({direction:?})"),
        CallEvent::RingStopped => {}
        CallEvent::RemoteTrack { kind } => println!("Receiving remote {kind}"),
        CallEvent::CallRejected { by } => println!("Call rejected by {by}"),
        CallEvent::CallEnded { peer, reason } => println!("Call with {peer} ended: {reason:?}"),
    }
}
