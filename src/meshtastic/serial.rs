use super::framer::{encode_frame, FrameDecoder};
use super::{heartbeat, text_packet, RadioSession};
use crate::config::MeshtasticConfig;
use crate::gateway::{DeviceEvent, DeviceLink, GatewayError, GatewayResult};
use crate::logutil::hex_snippet;
use crate::protobuf::meshtastic_generated as proto;
use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, trace, warn};
use prost::Message;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

struct Shared {
    writer: Mutex<Box<dyn SerialPort>>,
    stop: AtomicBool,
    connected: AtomicBool,
}

impl Shared {
    fn write(&self, msg: &proto::ToRadio) -> GatewayResult<()> {
        let payload = msg.encode_to_vec();
        let frame = encode_frame(&payload).ok_or_else(|| {
            GatewayError::TransportFailure(format!("frame of {} bytes is too large", payload.len()))
        })?;
        let mut port = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        port.write_all(&frame)?;
        port.flush()?;
        trace!("Sent ToRadio frame ({} bytes payload)", payload.len());
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// A Meshtastic radio attached over a serial port.
pub struct SerialLink {
    shared: Arc<Shared>,
    port_name: String,
}

impl SerialLink {
    /// Open the port, request the device configuration and start the reader,
    /// heartbeat and connect-timeout tasks. Events go to `events`.
    pub async fn open(cfg: &MeshtasticConfig, events: mpsc::Sender<DeviceEvent>) -> Result<Arc<Self>> {
        let port = open_port(&cfg.port, cfg.baud_rate).await?;
        let reader_port = port
            .try_clone()
            .with_context(|| format!("Failed to clone serial port handle for {}", cfg.port))?;

        let mut config_id: u32 = rand::random();
        if config_id == 0 {
            config_id = 1;
        }
        let session = RadioSession::new(config_id);
        let shared = Arc::new(Shared {
            writer: Mutex::new(port),
            stop: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        });
        debug!("Requesting device config with id 0x{:08x}", config_id);
        shared
            .write(&session.want_config())
            .map_err(|e| anyhow!("Failed to request device config on {}: {}", cfg.port, e))?;

        {
            let shared = shared.clone();
            let events = events.clone();
            tokio::task::spawn_blocking(move || read_loop(reader_port, session, events, shared));
        }
        if cfg.heartbeat_secs > 0 {
            tokio::spawn(heartbeat_loop(shared.clone(), Duration::from_secs(cfg.heartbeat_secs)));
        }
        tokio::spawn(connect_watchdog(
            shared.clone(),
            events,
            Duration::from_secs(cfg.connect_timeout_secs),
        ));

        info!("Opened Meshtastic device on {} at {} baud", cfg.port, cfg.baud_rate);
        Ok(Arc::new(SerialLink {
            shared,
            port_name: cfg.port.clone(),
        }))
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl DeviceLink for SerialLink {
    fn send_text(&self, packet_id: u32, text: &str, channel: u32) -> GatewayResult<()> {
        if self.shared.stopped() {
            return Err(GatewayError::NotConnected);
        }
        self.shared.write(&text_packet(packet_id, text, channel))
    }

    fn close(&self) {
        if self.shared.stop.swap(true, Ordering::Relaxed) {
            return;
        }
        let bye = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Disconnect(true)),
        };
        if let Err(e) = self.shared.write(&bye) {
            debug!("Disconnect request not delivered: {}", e);
        }
        info!("Closed Meshtastic device on {}", self.port_name);
    }
}

async fn open_port(port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
    debug!("Opening serial port {} at {} baud", port_name, baud_rate);

    let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(500));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;

    // Toggle DTR/RTS so the device wakes its serial API
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    sleep(Duration::from_millis(150)).await;

    // Drop boot console text already buffered
    let mut purge_buf = [0u8; 512];
    if let Ok(available) = port.bytes_to_read() {
        if available > 0 {
            let _ = port.read(&mut purge_buf);
        }
    }
    Ok(port)
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    mut session: RadioSession,
    events: mpsc::Sender<DeviceEvent>,
    shared: Arc<Shared>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buffer = [0u8; 1024];
    debug!("Serial reader started");
    while !shared.stopped() {
        match port.read(&mut buffer) {
            Ok(0) => {}
            Ok(n) => {
                trace!("RAW {} bytes: {}", n, hex_snippet(&buffer[..n], 64));
                decoder.push(&buffer[..n]);
                while let Some(frame) = decoder.next_frame() {
                    let Some(event) = session.on_frame(&frame) else {
                        continue;
                    };
                    if matches!(event, DeviceEvent::Connected(_)) {
                        shared.connected.store(true, Ordering::Relaxed);
                    }
                    if events.blocking_send(event).is_err() {
                        debug!("Event receiver gone; stopping serial reader");
                        return;
                    }
                }
                if session.take_reconfigure() {
                    shared.connected.store(false, Ordering::Relaxed);
                    if let Err(e) = shared.write(&session.want_config()) {
                        warn!("Failed to re-request device config: {}", e);
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                if !shared.stopped() {
                    error!("Serial read failed: {}", e);
                    let _ = events.blocking_send(DeviceEvent::Error(format!("serial read failed: {}", e)));
                }
                break;
            }
        }
    }
    shared.stop.store(true, Ordering::Relaxed);
    debug!("Serial reader stopped ({} stray bytes skipped)", decoder.skipped());
}

async fn heartbeat_loop(shared: Arc<Shared>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tick.tick().await;
        if shared.stopped() {
            break;
        }
        if let Err(e) = shared.write(&heartbeat()) {
            warn!("Heartbeat write failed: {}", e);
        }
    }
}

async fn connect_watchdog(shared: Arc<Shared>, events: mpsc::Sender<DeviceEvent>, wait: Duration) {
    sleep(wait).await;
    if shared.stopped() || shared.connected.load(Ordering::Relaxed) {
        return;
    }
    error!("Device sent no configuration within {}s", wait.as_secs());
    shared.stop.store(true, Ordering::Relaxed);
    let _ = events
        .send(DeviceEvent::Error(format!(
            "device sent no configuration within {}s",
            wait.as_secs()
        )))
        .await;
}
