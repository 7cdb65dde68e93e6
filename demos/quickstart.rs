use anyhow::{Context, Result};
use async_trait::async_trait;
use droidpilot::{Agent, AgentConfig, Coordinate, Device, DeviceError, HttpTransport, LoopEvent, MediaType, Screenshot};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Shows the model a fixed screen image and logs the actions it asks for.
struct StillFrame {
    path: PathBuf,
    width: u32,
    height: u32,
}

#[async_trait]
impl Device for StillFrame {
    async fn capture_screenshot(&self) -> Result<Screenshot, DeviceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| DeviceError::Failed(format!("reading {}: {e}", self.path.display())))?;
        Ok(Screenshot {
            bytes,
            width: self.width,
            height: self.height,
            media_type: MediaType::Png,
        })
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DeviceError> {
        info!(x, y, "tap");
        Ok(())
    }

    async fn key(&self, text: &str) -> Result<(), DeviceError> {
        info!(text, "key");
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), DeviceError> {
        info!(text, "type");
        Ok(())
    }

    async fn drag(&self, to: Coordinate) -> Result<(), DeviceError> {
        info!(x = to.x(), y = to.y(), "drag");
        Ok(())
    }

    async fn move_to(&self, to: Coordinate) -> Result<(), DeviceError> {
        info!(x = to.x(), y = to.y(), "move");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = std::env::var("SCREEN_PNG").context("SCREEN_PNG must point at a 1280x800 PNG")?;
    let goal = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Open the settings app and turn on Wi-Fi.".to_string());

    let device = StillFrame {
        path: path.into(),
        width: 1280,
        height: 800,
    };
    let transport = HttpTransport::from_env()?;
    let agent = Agent::with_defaults(
        device,
        transport,
        AgentConfig {
            max_turns: 10,
            ..Default::default()
        },
    );

    info!(max_turns = agent.config().max_turns, goal = %goal, "starting run");
    let mut run = agent.start(goal);
    while let Some(event) = run.next_event().await {
        match event {
            LoopEvent::Prose { turn, text } => println!("[turn {turn}] {text}"),
            LoopEvent::Finished { history } => println!("finished after {} messages", history.len()),
            LoopEvent::Failed { error } => println!("failed: {error}"),
            LoopEvent::Aborted => println!("aborted"),
        }
    }
    let report = run.finish().await?;
    println!("{}", serde_json::to_string_pretty(&report.metrics)?);
    Ok(())
}
