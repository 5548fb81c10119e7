//! Command dispatcher
//!
//! Decodes one message, executes it against the window table, the region
//! manager and the renderer, and writes at most one reply through the
//! transport. Owned and driven by the server thread only.

use crate::error::{BrokerError, BrokerResult};
use crate::keepalive::{keepalive_path, KeepAlive};
use crate::lifecycle::Lifecycle;
use crate::render::{Renderer, DEFAULT_TEXTURE};
use crate::shm::{RegionManager, PARAMS_SEGMENT, TEXTURE_SEGMENT};
use crate::table::ObjectTable;
use crate::transport::Transport;
use crate::window::Window;
use glaze_proto::command::{encode_handle, expected_pixel_len};
use glaze_proto::{
    Handle, HandshakeRecord, Opcode, ProtocolError, Request, SegmentInfo, Serial,
};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Settings the dispatcher needs from the server configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub page_size: usize,
    /// Broker socket; keep-alive sockets are named after it
    pub socket_path: PathBuf,
    pub poll_interval: Duration,
    pub log_transfers: bool,
}

/// Context created by `new_connection`
struct Connection {
    keepalive: Option<KeepAlive>,
}

pub struct Dispatcher {
    windows: ObjectTable<Window>,
    connections: ObjectTable<Connection>,
    dirty: bool,
    lifecycle: Arc<Lifecycle>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            windows: ObjectTable::new(config.page_size),
            connections: ObjectTable::new(config.page_size),
            dirty: false,
            lifecycle,
            config,
        }
    }

    pub fn windows(&self) -> &ObjectTable<Window> {
        &self.windows
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Execute one received message
    pub fn dispatch(
        &mut self,
        mut message: Serial,
        transport: &mut dyn Transport,
        regions: &mut RegionManager,
        renderer: &mut dyn Renderer,
    ) -> BrokerResult<Opcode> {
        let start = Instant::now();
        let request = Request::decode(&mut message, transport.mode().pixel_source())?;
        let opcode = request.opcode();

        match request {
            Request::NewWindow(rect) => {
                let handle = self.windows.create(Window::new(rect));
                debug!("New window {} at {}", handle, rect);
                transport.send(&encode_handle(handle), regions)?;
            }
            Request::ModifyWindow { handle, rect } => {
                self.windows.modify(handle, |window| window.set_rect(rect))?;
                debug!("Window {} moved to {}", handle, rect);
            }
            Request::CloseWindow { handle } => {
                let window = self.windows.delete(handle)?;
                if let Some(texture) = window.texture {
                    renderer.delete_texture(texture);
                }
                debug!("Closed window {}", handle);
            }
            Request::Texture {
                handle,
                width,
                height,
                pixels,
            } => self.texture(handle, width, height, pixels, regions, renderer)?,
            Request::ShmTexture => self.share_segment(opcode, TEXTURE_SEGMENT, transport, regions)?,
            Request::ShmParams => self.share_segment(opcode, PARAMS_SEGMENT, transport, regions)?,
            Request::NewConnection => self.new_connection(transport, regions)?,
        }

        if opcode.affects_windows() {
            self.dirty = true;
        }
        debug!("Dispatched {} in {:?}", opcode, start.elapsed());
        Ok(opcode)
    }

    fn texture(
        &mut self,
        handle: Handle,
        width: i32,
        height: i32,
        pixels: Option<Vec<u8>>,
        regions: &mut RegionManager,
        renderer: &mut dyn Renderer,
    ) -> BrokerResult<()> {
        // Segment data is consumed even when the request turns out to be invalid.
        let pixels = match pixels {
            Some(pixels) => pixels,
            None => regions.read_payload(TEXTURE_SEGMENT)?,
        };

        let expected = expected_pixel_len(width, height)?;
        if pixels.len() != expected {
            return Err(ProtocolError::PixelCountMismatch {
                expected,
                found: pixels.len(),
            }
            .into());
        }

        let existing = self.windows.get(handle)?.texture;
        let texture = renderer
            .upload_texture(existing, width, height, &pixels)
            .map_err(BrokerError::Render)?;
        self.windows.modify(handle, |window| {
            window.texture = Some(texture);
            window.texture_size = (width, height);
        })?;

        if self.config.log_transfers {
            debug!(
                "Texture {} for window {}: {}x{} ({} bytes)",
                texture,
                handle,
                width,
                height,
                pixels.len()
            );
        }
        Ok(())
    }

    fn share_segment(
        &mut self,
        opcode: Opcode,
        name: &'static str,
        transport: &mut dyn Transport,
        regions: &mut RegionManager,
    ) -> BrokerResult<()> {
        if !transport.can_hand_off() {
            return Err(ProtocolError::HandOffUnavailable(opcode).into());
        }
        regions.validate(name)?;

        // Counted only once the client actually holds the descriptor.
        let info = SegmentInfo {
            size: regions.capacity(name)? as u64,
            references: regions.reference_count(name)? as u64 + 1,
        };
        let doorbell = if name == PARAMS_SEGMENT {
            transport.doorbell_peer()?
        } else {
            None
        };

        let mut fds = vec![regions.descriptor_for(name)?];
        if let Some(doorbell) = &doorbell {
            fds.push(doorbell.as_fd());
        }
        transport.hand_off_descriptor(&fds, &info.encode())?;
        let references = regions.increase_reference(name)?;

        debug!(
            "Shared segment {} ({} bytes, {} references)",
            name, info.size, references
        );
        Ok(())
    }

    fn new_connection(
        &mut self,
        transport: &mut dyn Transport,
        regions: &mut RegionManager,
    ) -> BrokerResult<()> {
        let lease = regions.lease(PARAMS_SEGMENT)?;
        let id = self.connections.create(Connection { keepalive: None });
        let params_size = regions.capacity(PARAMS_SEGMENT)? as u64;
        let references = lease.references() as u64;

        let path = keepalive_path(&self.config.socket_path, id);
        let (record, keepalive) = match HandshakeRecord::new(id, params_size, references, Some(&path)) {
            Ok(record) => {
                match KeepAlive::spawn(
                    &self.config.socket_path,
                    id,
                    lease,
                    self.lifecycle.clone(),
                    self.config.poll_interval,
                ) {
                    Ok(keepalive) => (record, Some(keepalive)),
                    Err(e) => {
                        error!("Connection {} proceeds without keep-alive: {:#}", id, e);
                        (HandshakeRecord::new(id, params_size, references, None)?, None)
                    }
                }
            }
            Err(e) => {
                error!("Connection {} proceeds without keep-alive: {}", id, e);
                drop(lease);
                (HandshakeRecord::new(id, params_size, references, None)?, None)
            }
        };

        self.connections
            .modify(id, |connection| connection.keepalive = keepalive)?;
        transport.send(&record.encode(), regions)?;
        info!("New connection {}", id);
        Ok(())
    }

    /// Drop connections whose keep-alive client went away, and those that never had one
    pub fn reap_connections(&mut self) {
        let finished: Vec<Handle> = self
            .connections
            .iter()
            .filter(|(_, connection)| {
                connection
                    .keepalive
                    .as_ref()
                    .is_none_or(KeepAlive::is_finished)
            })
            .map(|(id, _)| id)
            .collect();

        for id in finished {
            let Ok(connection) = self.connections.delete(id) else {
                continue;
            };
            match connection.keepalive {
                Some(keepalive) => {
                    let pings = keepalive.pings();
                    let idle = keepalive.last_ping().map(|at| at.elapsed());
                    keepalive.join();
                    info!(
                        "Connection {} closed after {} pings (last ping {:?} ago)",
                        id, pings, idle
                    );
                }
                None => info!("Connection {} released without liveness tracking", id),
            }
        }
    }

    /// Texture drawn for windows without their own: the lowest live handle's texture
    fn background_texture(&self) -> u32 {
        self.windows
            .iter()
            .find_map(|(_, window)| window.texture)
            .unwrap_or(DEFAULT_TEXTURE)
    }

    /// Repaint every window if anything changed. Returns whether a pass ran.
    pub fn redraw(&mut self, renderer: &mut dyn Renderer, surface_size: (u32, u32)) -> bool {
        if !self.dirty {
            return false;
        }
        let start = Instant::now();
        let background = self.background_texture();

        renderer.clear();
        for (_, window) in self.windows.iter() {
            renderer.draw(
                window.texture.unwrap_or(background),
                window.source_region(),
                window.rect(),
                surface_size,
            );
        }
        if let Err(e) = renderer.swap_buffers() {
            warn!("Swap buffers failed: {:#}", e);
        }
        self.dirty = false;

        debug!(
            "Redrew {} windows in {:?}",
            self.windows.len(),
            start.elapsed()
        );
        true
    }

    /// Release every window texture and wait for keep-alive threads.
    /// Call after shutdown has been requested so the threads are exiting.
    pub fn teardown(&mut self, renderer: &mut dyn Renderer) {
        if !self.windows.is_empty() {
            debug!(
                "Releasing {} windows from {} pages ({} slots)",
                self.windows.len(),
                self.windows.page_count(),
                self.windows.capacity()
            );
        }
        for (handle, window) in self.windows.drain() {
            if let Some(texture) = window.texture {
                renderer.delete_texture(texture);
            }
            debug!("Released window {}", handle);
        }
        for (id, connection) in self.connections.drain() {
            if let Some(keepalive) = connection.keepalive {
                if keepalive.connected() {
                    debug!("Connection {} still attached to {:?}", id, keepalive.path());
                }
                keepalive.join();
            }
            debug!("Released connection {}", id);
        }
        self.dirty = false;
    }
}
