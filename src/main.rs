/*
 *  main.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Attach every USBD480 on the bus, keep the panels refreshed until told
 *  to stop
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use std::sync::Arc;

use anyhow::Context;
use embedded_graphics::mono_font::{MonoTextStyle, ascii::FONT_6X10};
use embedded_graphics::pixelcolor::Rgb565;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Baseline, Text};
use env_logger::Env;
use log::{error, info, warn};

#[cfg(unix)] // Only compile this block on Unix-like systems
use tokio::signal::unix::{signal, SignalKind}; // Import specific Unix signals

use usbd480fb::config;
use usbd480fb::display::drivers::mock::MockTransport;
use usbd480fb::display::{
    AttributeTable, BufferId, DeviceId, DisplaySession, DriverRegistry, FrameRegistry, SessionEnv,
};

include!(concat!(env!("OUT_DIR"), "/build_info.rs"));

/// Asynchronously waits for a SIGINT, SIGTERM, or SIGHUP signal.
async fn signal_handler() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received. Initiating graceful shutdown.");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received. Initiating graceful shutdown.");
        }
        _ = sighup.recv() => {
            info!("SIGHUP received. Initiating graceful shutdown.");
        }
    }
    Ok(())
}

/// One simulated 480x272 panel
fn attach_simulated(
    registry: &DriverRegistry,
    device: DeviceId,
    env: &SessionEnv,
) -> anyhow::Result<Vec<DisplaySession>> {
    let mock = MockTransport::with_geometry("USBD480-SIM", 480, 272);
    let session = tokio::task::block_in_place(|| registry.attach(device, "sim-0", Arc::new(mock), env))?;
    Ok(vec![session])
}

#[cfg(feature = "usb")]
fn attach_usb(registry: &DriverRegistry, env: &SessionEnv) -> anyhow::Result<Vec<DisplaySession>> {
    use usbd480fb::display::drivers::usb::{NusbTransport, scan};

    let mut sessions = Vec::new();
    for candidate in scan(|vendor, product| registry.supports(vendor, product))? {
        let transport = match NusbTransport::open(&candidate.info) {
            Ok(transport) => transport,
            Err(e) => {
                error!("{}: {}", candidate.id, e);
                continue;
            }
        };
        let device = DeviceId::new(candidate.vendor, candidate.product);
        // discovery blocks on control transfers
        match tokio::task::block_in_place(|| {
            registry.attach(device, &candidate.id, Arc::new(transport), env)
        }) {
            Ok(session) => sessions.push(session),
            Err(e) => error!("{}: {}", candidate.id, e),
        }
    }
    Ok(sessions)
}

#[cfg(not(feature = "usb"))]
fn attach_usb(_registry: &DriverRegistry, _env: &SessionEnv) -> anyhow::Result<Vec<DisplaySession>> {
    anyhow::bail!("built without USB support, use --simulate")
}

/// Color bars plus the device name
fn paint_test_pattern(frames: &FrameRegistry, id: BufferId, name: &str) -> anyhow::Result<()> {
    let mut canvas = frames.canvas(id).context("pixel buffer is gone")?;
    let size = canvas.size();
    let bars = [
        Rgb565::WHITE,
        Rgb565::YELLOW,
        Rgb565::CYAN,
        Rgb565::GREEN,
        Rgb565::MAGENTA,
        Rgb565::RED,
        Rgb565::BLUE,
        Rgb565::BLACK,
    ];
    let width = size.width.div_ceil(bars.len() as u32);
    for (i, color) in bars.iter().enumerate() {
        Rectangle::new(Point::new((i as u32 * width) as i32, 0), Size::new(width, size.height))
            .into_styled(PrimitiveStyle::with_fill(*color))
            .draw(&mut canvas)?;
    }
    Text::with_baseline(
        name,
        Point::new(4, 4),
        MonoTextStyle::new(&FONT_6X10, Rgb565::BLACK),
        Baseline::Top,
    )
    .draw(&mut canvas)?;
    Ok(())
}

fn print_attributes(attributes: &AttributeTable, device: &str) {
    for name in attributes.names(device) {
        match attributes.read(device, name) {
            Ok(value) => println!("{}/{}: {}", device, name, value.trim_end()),
            Err(e) => warn!("{}", e),
        }
    }
}

/// Everything between attach and detach
async fn run(
    sessions: &[DisplaySession],
    frames: &FrameRegistry,
    attributes: &AttributeTable,
    test_pattern: bool,
) -> anyhow::Result<()> {
    for session in sessions {
        if test_pattern {
            let label = format!("{} {}", session.descriptor().name, session.id());
            paint_test_pattern(frames, session.buffer_id(), &label)?;
        }
        print_attributes(attributes, session.id());
    }

    info!("{} display(s) running", sessions.len());
    signal_handler().await?;
    Ok(())
}

/// Run until signalled, then detach every session whatever the outcome
async fn serve(
    sessions: Vec<DisplaySession>,
    frames: &FrameRegistry,
    attributes: &AttributeTable,
    test_pattern: bool,
) -> anyhow::Result<()> {
    let outcome = run(&sessions, frames, attributes, test_pattern).await;
    if let Err(e) = &outcome {
        error!("{:#}", e);
    }

    // newest first
    for session in sessions.into_iter().rev() {
        let id = session.id().to_string();
        let report = session.detach().await;
        info!(
            "{}: {} cycles, {} upload failures, {} control failures, {} flips skipped",
            id,
            report.stats.cycles,
            report.stats.upload_failures,
            report.stats.control_failures,
            report.stats.flips_skipped
        );
    }

    outcome
}

#[tokio::main] // Requires the `tokio` runtime with `macros` and `rt-multi-thread` features
async fn main() -> anyhow::Result<()> {
    let (config, cli) = config::load()?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_level()))
        .format_timestamp_secs()
        .init();

    info!("{} v.{} built {} ({})", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"), BUILD_DATE, BUILD_PROFILE);

    let driver = config.driver();
    let device = driver.device_id();
    let registry = DriverRegistry::with_usbd480(device, driver.session_config());

    let frames = Arc::new(FrameRegistry::new());
    let attributes = Arc::new(AttributeTable::new());
    let env = SessionEnv::new(frames.clone(), attributes.clone());

    let sessions = if cli.simulate {
        attach_simulated(&registry, device, &env)?
    } else {
        attach_usb(&registry, &env)?
    };

    if sessions.is_empty() {
        warn!("no {} display found", device);
        return Ok(());
    }

    serve(sessions, &frames, &attributes, cli.test_pattern).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbd480fb::display::SessionConfig;

    #[tokio::test]
    async fn test_failed_run_still_detaches() {
        let frames = Arc::new(FrameRegistry::new());
        let attributes = Arc::new(AttributeTable::new());
        let env = SessionEnv::new(frames.clone(), attributes.clone());
        let mock = MockTransport::with_geometry("USBD480-SIM", 480, 272);
        let session =
            DisplaySession::attach("sim-0", Arc::new(mock), &env, &SessionConfig::default()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(attributes.names("sim-0").len(), 4);

        // no such pixel buffer here, painting fails before any signal wait
        let elsewhere = FrameRegistry::new();
        let result = serve(vec![session], &elsewhere, &attributes, true).await;

        assert!(result.is_err());
        assert!(frames.is_empty());
        assert!(attributes.is_empty());
    }
}
