use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{error, info};

use crate::detector::FrequencyDetector;
use crate::sampler::Sampler;
use crate::store::ProfileStore;
use crate::summary::AppSummary;
use crate::timestamp::Timestamp;

/// State shared between the pipeline thread and the query listener: the
/// pause flag (owned by the controller, toggled by the listener) and the
/// summaries of the most recent detection pass.
#[derive(Clone, Default)]
pub struct PipelineHandle {
    paused: Arc<AtomicBool>,
    pub(crate) current_summaries: Arc<Mutex<Vec<AppSummary>>>,
}

impl PipelineHandle {
    pub fn new() -> PipelineHandle {
        PipelineHandle::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn current_summaries(&self) -> Vec<AppSummary> {
        self.current_summaries.lock().unwrap().clone()
    }
}

/// Runs the sampler and the detector on one shared cadence.
///
/// Each tick samples first, then runs at most one detection pass, gated on
/// the latest-sample marker having advanced since the previous pass. The
/// marker is read before any profile, so a sample cycle that is still
/// writing when the detector starts is picked up on the next tick instead
/// of being observed half-done.
pub struct PipelineController {
    sampler: Sampler,
    detector: FrequencyDetector,
    store: ProfileStore,
    period: Duration,
    detection_enabled: bool,
    handle: PipelineHandle,
    last_detected_ts: Option<Timestamp>,
}

impl PipelineController {
    pub fn new(
        sampler: Sampler,
        detector: FrequencyDetector,
        store: ProfileStore,
        period: Duration,
        detection_enabled: bool,
        handle: PipelineHandle,
    ) -> PipelineController {
        PipelineController {
            sampler,
            detector,
            store,
            period,
            detection_enabled,
            handle,
            last_detected_ts: None,
        }
    }

    /// Spawns the pipeline thread. It ticks until `shutdown` delivers a
    /// message or disconnects; a tick in progress always completes.
    /// `on_exit` runs when the thread stops for any reason, so the rest of
    /// the daemon can be told to wind down after a fatal store failure.
    pub fn spawn(mut self, shutdown: Receiver<()>, on_exit: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
        thread::Builder::new()
            .name("wades-pipeline".to_string())
            .spawn(move || {
                self.run(shutdown);
                on_exit();
            })
            .expect("couldn't spawn pipeline thread")
    }

    fn run(&mut self, shutdown: Receiver<()>) {
        let mut last_sleep_overshoot = Duration::ZERO;
        loop {
            let tick_started = Instant::now();
            if !self.tick() {
                return;
            }

            let intended_wakeup = tick_started + self.period;
            let wait = intended_wakeup
                .saturating_duration_since(Instant::now())
                .saturating_sub(last_sleep_overshoot);
            let before_sleep = Instant::now();
            match shutdown.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    info!("pipeline shutting down");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            last_sleep_overshoot = before_sleep.elapsed().saturating_sub(wait);
        }
    }

    /// One cadence tick: sample, then detect at most once per new batch.
    /// Returns false on the one fatal condition, loss of the store root;
    /// every other failure abandons the cycle and retries next tick.
    pub fn tick(&mut self) -> bool {
        if let Err(err) = self.sampler.collect_cycle(&self.store) {
            error!("sample cycle abandoned: {err}");
            if !self.store.root().is_dir() {
                error!(
                    "store root {} is gone; stopping the pipeline",
                    self.store.root().display()
                );
                return false;
            }
        }

        if !self.detection_enabled || self.handle.is_paused() {
            return true;
        }
        let Some(marker) = self.store.get_last_sample_ts() else {
            return true;
        };
        if self.last_detected_ts == Some(marker) {
            return true;
        }
        self.run_detection(marker);
        self.last_detected_ts = Some(marker);
        true
    }

    fn run_detection(&mut self, marker: Timestamp) {
        let mut summaries = Vec::new();
        for name in self.store.list_names() {
            let Some(profile) = self.store.get(&name) else {
                continue;
            };
            // Not seen in the marker's cycle; skip until it shows up again.
            if profile.last_timestamp() != Some(marker) {
                continue;
            }
            summaries.push(self.detector.detect(&profile));
        }

        for summary in summaries.iter().filter(|summary| summary.is_anomalous()) {
            if let Err(err) = self.store.append_anomaly(summary) {
                error!("could not append to the anomaly log: {err}");
            }
        }
        info!("detection pass scored {} applications", summaries.len());
        *self.handle.current_summaries.lock().unwrap() = summaries;
    }
}
