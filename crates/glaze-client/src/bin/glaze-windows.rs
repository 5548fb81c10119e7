//! glaze-windows - demo client
//!
//! Opens a few windows with gradient textures and slides them across the
//! surface. Uses the transport named by `GLAZE_TRANSPORT`, so it can be
//! listed under `launcher.clients` in the broker config.

use anyhow::{Context, Result};
use glaze_client::{Client, KeepAliveClient, ShmSession, TransportMode};
use glaze_proto::{Handle, Rect, TRANSPORT_ENV};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const WINDOWS: i32 = 3;
const SIZE: i32 = 64;
const FRAMES: i32 = 120;

/// Either way of reaching the broker, behind one set of calls
enum Session {
    Socket(Client),
    Shm(ShmSession),
}

impl Session {
    fn new_window(&mut self, rect: Rect) -> Result<Handle> {
        Ok(match self {
            Session::Socket(client) => client.new_window(rect)?,
            Session::Shm(session) => session.new_window(rect)?,
        })
    }

    fn modify_window(&mut self, handle: Handle, rect: Rect) -> Result<()> {
        match self {
            Session::Socket(client) => client.modify_window(handle, rect)?,
            Session::Shm(session) => session.modify_window(handle, rect)?,
        }
        Ok(())
    }

    fn close_window(&mut self, handle: Handle) -> Result<()> {
        match self {
            Session::Socket(client) => client.close_window(handle)?,
            Session::Shm(session) => session.close_window(handle)?,
        }
        Ok(())
    }

    fn texture(&mut self, handle: Handle, pixels: &[u8]) -> Result<()> {
        match self {
            Session::Socket(client) => client.texture(handle, SIZE, SIZE, pixels)?,
            Session::Shm(session) => session.texture(handle, SIZE, SIZE, pixels)?,
        }
        Ok(())
    }
}

/// RGBA gradient tinted per window
fn gradient(tint: u8) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((SIZE * SIZE * 4) as usize);
    for y in 0..SIZE {
        for x in 0..SIZE {
            pixels.extend_from_slice(&[
                (x * 255 / SIZE) as u8,
                (y * 255 / SIZE) as u8,
                tint,
                255,
            ]);
        }
    }
    pixels
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "glaze_windows=debug,glaze_client=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mode = std::env::var(TRANSPORT_ENV)
        .ok()
        .and_then(|mode| mode.parse::<TransportMode>().ok())
        .unwrap_or_default();
    let client = Client::from_env();
    info!("Connecting to {:?} ({} transport)", client.socket_path(), mode);

    let mut session = match mode {
        TransportMode::Socket => Session::Socket(client),
        TransportMode::SharedMemory => Session::Shm(
            ShmSession::connect(client).context("Failed to map broker segments")?,
        ),
    };

    // Holding the keep-alive connection keeps our connection context alive.
    let _keepalive = match &mut session {
        Session::Shm(shm) => {
            let record = shm.new_connection()?;
            info!("Connection {}", record.connection_id);
            match record.keepalive_path() {
                Some(path) => Some(KeepAliveClient::connect(&path)?),
                None => {
                    warn!("Broker offered no keep-alive socket");
                    None
                }
            }
        }
        Session::Socket(_) => None,
    };

    let mut windows = Vec::new();
    for i in 0..WINDOWS {
        let rect = Rect::new(i * (SIZE + 8), i * 16, SIZE, SIZE);
        let handle = session.new_window(rect)?;
        session.texture(handle, &gradient((i * 80) as u8))?;
        windows.push((handle, rect));
    }
    info!("Opened {} windows", windows.len());

    for frame in 0..FRAMES {
        for (handle, rect) in &windows {
            let moved = Rect::new(rect.x + frame * 2, rect.y + frame, rect.w, rect.h);
            session.modify_window(*handle, moved)?;
        }
        std::thread::sleep(Duration::from_millis(16));
    }

    for (handle, _) in windows {
        session.close_window(handle)?;
    }
    info!("Done");
    Ok(())
}
