/*
 *  display/scheduler.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Periodic frame upload and device page flipping
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

//! The refresh protocol.
//!
//! The device holds two frame pages back to back in its own memory, at
//! offset `0` and at offset `frame_len`. The host keeps a single frame. Every
//! cycle targets the other page: point the write address at it, push the
//! whole frame over the bulk endpoint, then point the scan-out address at it.
//! The next cycle is only scheduled once the current one has returned, so the
//! transfers of one session never overlap.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::display::control::ControlChannel;
use crate::display::error::{SessionError, TransportError};
use crate::display::memory::FrameHandle;
use crate::display::traits::{DiagnosticSink, Operation, TransportFault};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_BULK_ENDPOINT: u8 = 0x02;
/// The first upload waits this many refresh intervals
pub const INITIAL_DELAY_FACTOR: u32 = 4;

/// When the scan-out address moves to the freshly written page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlipMode {
    /// Write and show the same page every cycle, even when the upload failed
    SameCycle,
    /// Show the written page only once its upload completed in full; a failed
    /// upload leaves the last complete page on screen.
    ///
    /// Pages still alternate every cycle, so the cycle after a skipped flip
    /// writes into the page that is on screen. Only a run of complete uploads
    /// is tear-free.
    #[default]
    WriteThenFlip,
}

impl FromStr for FlipMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "same-cycle" => Ok(FlipMode::SameCycle),
            "write-then-flip" => Ok(FlipMode::WriteThenFlip),
            other => Err(format!("unknown flip mode '{other}' (same-cycle|write-then-flip)")),
        }
    }
}

/// Which of the two device pages the next cycle writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageState {
    next: u8,
}

impl PageState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page the next cycle will target (0 or 1)
    pub fn active(&self) -> u8 {
        self.next
    }

    /// Hand out the current page and flip to the other one
    pub fn advance(&mut self) -> u8 {
        let page = self.next;
        self.next ^= 1;
        page
    }

    /// Device memory offset of a page
    pub fn offset(page: u8, page_len: u32) -> u32 {
        if page == 0 { 0 } else { page_len }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub initial_delay: Duration,
    pub bulk_timeout: Duration,
    pub endpoint: u8,
    pub flip_mode: FlipMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            initial_delay: DEFAULT_REFRESH_INTERVAL * INITIAL_DELAY_FACTOR,
            bulk_timeout: DEFAULT_BULK_TIMEOUT,
            endpoint: DEFAULT_BULK_ENDPOINT,
            flip_mode: FlipMode::default(),
        }
    }
}

/// Counters shared between the refresh task and its owner
#[derive(Debug, Default)]
pub struct RefreshStats {
    cycles: AtomicU64,
    upload_failures: AtomicU64,
    control_failures: AtomicU64,
    flips_skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub upload_failures: u64,
    pub control_failures: u64,
    pub flips_skipped: u64,
}

impl RefreshStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Acquire),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            control_failures: self.control_failures.load(Ordering::Relaxed),
            flips_skipped: self.flips_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub page: u8,
    pub offset: u32,
    /// Bytes the device accepted, `None` when the upload failed
    pub uploaded: Option<usize>,
    /// Whether the scan-out address was moved to `offset`
    pub shown: bool,
}

/// Everything one cycle touches. Owned by the refresh task.
pub(crate) struct RefreshCycle {
    device: String,
    channel: Arc<ControlChannel>,
    frame: FrameHandle,
    pages: PageState,
    page_len: u32,
    staging: Vec<u8>,
    endpoint: u8,
    bulk_timeout: Duration,
    flip_mode: FlipMode,
    sink: Arc<dyn DiagnosticSink>,
    stats: Arc<RefreshStats>,
}

impl RefreshCycle {
    pub(crate) fn new(
        device: &str,
        channel: Arc<ControlChannel>,
        frame: FrameHandle,
        config: &SchedulerConfig,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, SessionError> {
        // page 1 starts right behind page 0 and has to be addressable
        let page_len = u32::try_from(frame.len())
            .ok()
            .filter(|len| len.checked_mul(2).is_some())
            .ok_or_else(|| {
                SessionError::SchedulerStart(format!(
                    "frame of {} bytes exceeds the device address range",
                    frame.len()
                ))
            })?;

        Ok(Self {
            device: device.to_string(),
            channel,
            staging: Vec::with_capacity(frame.len()),
            frame,
            pages: PageState::new(),
            page_len,
            endpoint: config.endpoint,
            bulk_timeout: config.bulk_timeout,
            flip_mode: config.flip_mode,
            sink,
            stats: Arc::new(RefreshStats::default()),
        })
    }

    fn fault(&self, operation: Operation, error: TransportError) {
        let counter = match operation {
            Operation::BulkUpload => &self.stats.upload_failures,
            _ => &self.stats.control_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.sink.transport_fault(&TransportFault {
            device: self.device.clone(),
            operation,
            error,
        });
    }

    /// Upload the frame into the next page and flip to it
    pub(crate) fn run_once(&mut self) -> CycleReport {
        let page = self.pages.advance();
        let offset = PageState::offset(page, self.page_len);

        if let Err(e) = self.channel.set_write_address(offset) {
            self.fault(Operation::SetWriteAddress, e);
        }

        self.frame.snapshot_into(&mut self.staging);
        let uploaded = match self.channel.upload(self.endpoint, &self.staging, self.bulk_timeout) {
            Ok(sent) => {
                if sent < self.staging.len() {
                    warn!("{}: short upload, {} of {} bytes", self.device, sent, self.staging.len());
                    self.fault(
                        Operation::BulkUpload,
                        TransportError::ShortResponse {
                            expected: self.staging.len(),
                            actual: sent,
                        },
                    );
                }
                Some(sent)
            }
            Err(e) => {
                self.fault(Operation::BulkUpload, e);
                None
            }
        };

        let flip = match self.flip_mode {
            FlipMode::SameCycle => true,
            FlipMode::WriteThenFlip => uploaded == Some(self.staging.len()),
        };

        let shown = if flip {
            match self.channel.set_show_address(offset) {
                Ok(()) => true,
                Err(e) => {
                    self.fault(Operation::SetShowAddress, e);
                    false
                }
            }
        } else {
            self.stats.flips_skipped.fetch_add(1, Ordering::Relaxed);
            false
        };

        self.stats.cycles.fetch_add(1, Ordering::Release);
        CycleReport { page, offset, uploaded, shown }
    }
}

/// Handle to a running refresh task
///
/// The task runs one cycle, sleeps for the refresh interval, and repeats.
/// [`RefreshScheduler::stop`] returns only after the task has exited, which
/// includes letting an in-flight cycle finish its transfers.
pub struct RefreshScheduler {
    device: String,
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<RefreshStats>,
}

impl RefreshScheduler {
    /// Spawn the refresh task on the current tokio runtime
    pub(crate) fn start(cycle: RefreshCycle, config: &SchedulerConfig) -> Result<Self, SessionError> {
        let runtime = Handle::try_current()
            .map_err(|e| SessionError::SchedulerStart(e.to_string()))?;

        let device = cycle.device.clone();
        let stats = Arc::clone(&cycle.stats);
        let (stop_tx, stop_rx) = watch::channel(false);

        let join = runtime.spawn(refresh_loop(cycle, stop_rx, config.initial_delay, config.interval));
        debug!(
            "{}: refresh scheduler started ({:?} interval, first upload in {:?}, {:?})",
            device, config.interval, config.initial_delay, config.flip_mode
        );

        Ok(Self {
            device,
            stop_tx,
            join: Some(join),
            stats,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Cancel the task and wait until it has fully returned
    pub async fn stop(mut self) -> StatsSnapshot {
        // the task may already be gone, nothing to signal then
        let _ = self.stop_tx.send(true);

        if let Some(join) = self.join.take() {
            match join.await {
                Ok(()) => debug!("{}: refresh scheduler stopped", self.device),
                Err(e) if e.is_panic() => error!("{}: refresh task panicked", self.device),
                Err(e) => warn!("{}: refresh task ended abnormally: {}", self.device, e),
            }
        }
        self.stats.snapshot()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        // dropped without stop(): can't wait here, cancel what we can
        if let Some(join) = self.join.take() {
            let _ = self.stop_tx.send(true);
            join.abort();
            warn!("{}: refresh scheduler dropped while running, task aborted", self.device);
        }
    }
}

async fn refresh_loop(
    mut cycle: RefreshCycle,
    mut stop: watch::Receiver<bool>,
    initial_delay: Duration,
    interval: Duration,
) {
    let device = cycle.device.clone();
    let stats = Arc::clone(&cycle.stats);
    let mut delay = initial_delay;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        // transfers block, keep them off the async workers
        let outcome = tokio::task::spawn_blocking(move || {
            let report = cycle.run_once();
            (cycle, report)
        })
        .await;

        match outcome {
            Ok((returned, report)) => {
                trace!("{}: {:?}", device, report);
                cycle = returned;
            }
            Err(e) => {
                error!("{}: refresh cycle failed: {}", device, e);
                return;
            }
        }
        delay = interval;
    }

    debug!("{}: refresh loop exiting after {} cycles", device, stats.snapshot().cycles);
}
