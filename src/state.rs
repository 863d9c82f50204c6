//! Shared state written by the UI context and read by the scheduler.
//!
//! Flags are atomics; larger values sit behind `RwLock`s. The scheduler only
//! ever reads, through [`PipelineState::snapshot`], once per cycle.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Rectangle in absolute screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRegion {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Result<Self, String> {
        if width == 0 || height == 0 {
            return Err("Capture region has zero width or height".to_string());
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Parses `x,y,width,height`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(format!("Expected x,y,width,height but got '{}'", s));
        }
        let x = parts[0]
            .parse::<i32>()
            .map_err(|e| format!("Invalid x '{}': {}", parts[0], e))?;
        let y = parts[1]
            .parse::<i32>()
            .map_err(|e| format!("Invalid y '{}': {}", parts[1], e))?;
        let width = parts[2]
            .parse::<u32>()
            .map_err(|e| format!("Invalid width '{}': {}", parts[2], e))?;
        let height = parts[3]
            .parse::<u32>()
            .map_err(|e| format!("Invalid height '{}': {}", parts[3], e))?;
        Self::new(x, y, width, height)
    }
}

impl fmt::Display for CaptureRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{} {}x{}", self.x, self.y, self.width, self.height)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub condition_text: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CyclePhase {
    Idle,
    AwaitingCapture,
    Analyzing,
}

impl CyclePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CyclePhase::AwaitingCapture,
            2 => CyclePhase::Analyzing,
            _ => CyclePhase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CyclePhase::Idle => 0,
            CyclePhase::AwaitingCapture => 1,
            CyclePhase::Analyzing => 2,
        }
    }
}

/// Values the scheduler reads once at the start of a cycle.
#[derive(Debug, Clone)]
pub struct CycleSnapshot {
    pub system_prompt: String,
    pub alert: Option<String>,
}

pub struct PipelineState {
    running: AtomicBool,
    paused: AtomicBool,
    capture_in_progress: AtomicBool,
    selecting_region: AtomicBool,
    hide_during_capture: AtomicBool,
    phase: AtomicU8,
    capture_region: RwLock<Option<CaptureRegion>>,
    system_prompt: RwLock<String>,
    alert_rule: RwLock<AlertRule>,
}

impl PipelineState {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            capture_in_progress: AtomicBool::new(false),
            selecting_region: AtomicBool::new(false),
            hide_during_capture: AtomicBool::new(true),
            phase: AtomicU8::new(CyclePhase::Idle.as_u8()),
            capture_region: RwLock::new(None),
            system_prompt: RwLock::new(system_prompt.into()),
            alert_rule: RwLock::new(AlertRule::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if !paused {
            self.selecting_region.store(false, Ordering::SeqCst);
        }
    }

    /// Returns the new paused value.
    pub fn toggle_paused(&self) -> bool {
        let paused = !self.is_paused();
        self.set_paused(paused);
        paused
    }

    pub fn is_selecting_region(&self) -> bool {
        self.selecting_region.load(Ordering::SeqCst)
    }

    pub fn begin_region_selection(&self) {
        self.selecting_region.store(true, Ordering::SeqCst);
    }

    /// Ends interactive selection. `None` means cancelled: the previous
    /// region stays in place.
    pub fn finish_region_selection(&self, region: Option<CaptureRegion>) {
        if let Some(region) = region {
            *self.capture_region.write() = Some(region);
        }
        self.selecting_region.store(false, Ordering::SeqCst);
    }

    pub fn capture_region(&self) -> Option<CaptureRegion> {
        *self.capture_region.read()
    }

    /// `None` captures the full screen.
    pub fn set_region(&self, region: Option<CaptureRegion>) {
        *self.capture_region.write() = region;
    }

    pub fn hide_during_capture(&self) -> bool {
        self.hide_during_capture.load(Ordering::SeqCst)
    }

    pub fn set_hide_during_capture(&self, hide: bool) {
        self.hide_during_capture.store(hide, Ordering::SeqCst);
    }

    pub fn system_prompt(&self) -> String {
        self.system_prompt.read().clone()
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        *self.system_prompt.write() = prompt.into();
    }

    pub fn alert_rule(&self) -> AlertRule {
        self.alert_rule.read().clone()
    }

    /// Replaces the active rule. Blank text clears instead.
    pub fn set_alert(&self, condition: impl Into<String>) {
        let condition = condition.into();
        let mut rule = self.alert_rule.write();
        if condition.trim().is_empty() {
            rule.condition_text.clear();
            rule.active = false;
        } else {
            rule.condition_text = condition;
            rule.active = true;
        }
    }

    /// Deactivates the rule but keeps its text.
    pub fn clear_alert(&self) {
        self.alert_rule.write().active = false;
    }

    pub fn phase(&self) -> CyclePhase {
        CyclePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_phase(&self, phase: CyclePhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub fn is_capture_in_progress(&self) -> bool {
        self.capture_in_progress.load(Ordering::SeqCst)
    }

    /// Claims the single capture slot. Returns false if already taken.
    pub(crate) fn try_begin_capture(&self) -> bool {
        self.capture_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_capture(&self) {
        self.capture_in_progress.store(false, Ordering::SeqCst);
    }

    pub fn can_start_cycle(&self) -> bool {
        self.is_running() && !self.is_paused() && !self.is_selecting_region()
    }

    pub fn snapshot(&self) -> CycleSnapshot {
        let rule = self.alert_rule();
        CycleSnapshot {
            system_prompt: self.system_prompt(),
            alert: rule.active.then_some(rule.condition_text),
        }
    }
}
