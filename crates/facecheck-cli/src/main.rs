use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use facecheck_core::spoof::TextureHistory;
use facecheck_core::{ReflectionGuard, TextureDynamicsGuard};

#[zbus::proxy(
    interface = "org.freedesktop.FaceCheck1",
    default_service = "org.freedesktop.FaceCheck1",
    default_path = "/org/freedesktop/FaceCheck1"
)]
trait FaceCheck {
    fn submit_frame(&self, session_id: &str, frame: &[u8]) -> zbus::Result<String>;
    fn query_session(&self, session_id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facecheck", version, about = "FaceCheck liveness verification")]
struct Cli {
    /// Talk to the daemon on the session bus instead of the system bus.
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit frames to one session, in order.
    Submit {
        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
        /// Write the first-frame snapshot here once all steps pass.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Show a session without submitting a frame.
    Query { id: String },
    /// Show daemon status.
    Status,
    /// Run the reflection heuristic on a local image.
    Glare { image: PathBuf },
    /// Run the texture dynamics heuristic over a local frame sequence.
    Texture {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let session_bus = cli.session_bus || std::env::var("FACECHECK_SESSION_BUS").is_ok();

    match cli.cmd {
        Commands::Submit {
            session,
            snapshot,
            frames,
        } => {
            let proxy = connect(session_bus).await?;
            submit(&proxy, session, snapshot.as_deref(), &frames).await
        }
        Commands::Query { id } => {
            let proxy = connect(session_bus).await?;
            let json = proxy
                .query_session(&id)
                .await
                .with_context(|| format!("query for session {id} failed"))?;
            print_json(&json)
        }
        Commands::Status => {
            let proxy = connect(session_bus).await?;
            let json = proxy.status().await.context("status request failed")?;
            print_json(&json)
        }
        Commands::Glare { image } => glare(&image),
        Commands::Texture { images } => texture(&images),
    }
}

async fn connect(session_bus: bool) -> Result<FaceCheckProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    FaceCheckProxy::new(&conn)
        .await
        .context("facecheckd is not reachable on the bus")
}

async fn submit(
    proxy: &FaceCheckProxy<'_>,
    session: Option<String>,
    snapshot: Option<&Path>,
    frames: &[PathBuf],
) -> Result<()> {
    let mut session_id = session.unwrap_or_default();

    for path in frames {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        tracing::debug!(
            path = %path.display(),
            session_id = %session_id,
            bytes = bytes.len(),
            "submitting frame"
        );
        let json = proxy
            .submit_frame(&session_id, &bytes)
            .await
            .with_context(|| format!("frame {} rejected", path.display()))?;
        let response: serde_json::Value =
            serde_json::from_str(&json).context("daemon returned malformed JSON")?;

        if let Some(id) = response["session_id"].as_str() {
            if id != session_id {
                tracing::info!(session_id = id, "session started");
            }
            session_id = id.to_string();
        }
        println!(
            "{}: step={} message={:?}",
            path.display(),
            response["current_step"].as_str().unwrap_or("-"),
            response["message"].as_str().unwrap_or_default(),
        );

        if response["all_passed"].as_bool() == Some(true) {
            println!("session {session_id}: all steps passed");
            if let (Some(dest), Some(encoded)) = (snapshot, response["final_snapshot"].as_str()) {
                let jpeg = STANDARD
                    .decode(encoded)
                    .context("snapshot is not valid base64")?;
                std::fs::write(dest, jpeg)
                    .with_context(|| format!("failed to write {}", dest.display()))?;
                println!("snapshot written to {}", dest.display());
            }
            return Ok(());
        }
    }

    println!("session {session_id}: not complete yet");
    Ok(())
}

fn print_json(json: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn load_rgb(path: &Path) -> Result<image::RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8())
}

fn glare(path: &Path) -> Result<()> {
    let report = ReflectionGuard::default().inspect(&load_rgb(path)?);
    println!(
        "{}: bright={:.3} glare={:.3} -> {}",
        path.display(),
        report.bright_fraction,
        report.glare_fraction,
        if report.detected { "REFLECTION" } else { "ok" }
    );
    Ok(())
}

fn texture(paths: &[PathBuf]) -> Result<()> {
    if paths.len() < 2 {
        bail!("texture analysis needs at least two frames");
    }
    let guard = TextureDynamicsGuard::default();
    let mut history = TextureHistory::default();
    let mut replay_like = false;

    for path in paths {
        let report = guard.observe(&mut history, &load_rgb(path)?);
        tracing::debug!(path = %path.display(), report = ?report, "texture sample");
        match report.std_dev {
            Some(std_dev) => println!(
                "{}: samples={} std_dev={std_dev:.2}",
                path.display(),
                report.samples
            ),
            None => println!("{}: samples={}", path.display(), report.samples),
        }
        replay_like |= report.replay_like;
    }

    println!("{}", if replay_like { "REPLAY-LIKE" } else { "ok" });
    Ok(())
}
