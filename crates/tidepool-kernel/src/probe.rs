//! [`EnvironmentProbe`] – the agent's window onto the host device.
//!
//! The runtime never reads hardware directly; it asks an injected probe for
//! static [`DeviceCapabilities`], live [`RealTimeStats`] and a stable device
//! identifier.  [`ScriptedProbe`] replays canned vitals for tests and
//! simulation.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use tidepool_types::{DeviceCapabilities, RealTimeStats};

/// Source of device capability, vitals and identity.
pub trait EnvironmentProbe: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    /// Sample the live vitals.  Called once per resource tick.
    fn stats(&self) -> RealTimeStats;

    /// Identifier that stays stable across restarts on the same device.
    fn device_id(&self) -> String;
}

// ────────────────────────────────────────────────────────────────────────────
// Device fingerprint
// ────────────────────────────────────────────────────────────────────────────

/// Environment signals folded into the device identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSignals {
    pub user_agent: String,
    pub locale: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub timezone_offset_minutes: i32,
    pub render_signature: String,
}

impl DeviceSignals {
    fn canonical(&self) -> String {
        format!(
            "{}|{}|{}x{}|{}|{}",
            self.user_agent,
            self.locale,
            self.screen_width,
            self.screen_height,
            self.timezone_offset_minutes,
            self.render_signature
        )
    }
}

/// Fold `signals` into a 32-bit hash and render it as `device_<base36>`.
///
/// ```
/// use tidepool_kernel::probe::{device_id, DeviceSignals};
///
/// let signals = DeviceSignals { locale: "en-GB".into(), ..Default::default() };
/// assert_eq!(device_id(&signals), device_id(&signals.clone()));
/// assert!(device_id(&signals).starts_with("device_"));
/// ```
pub fn device_id(signals: &DeviceSignals) -> String {
    let hash = signals
        .canonical()
        .bytes()
        .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(i32::from(b)));
    format!("device_{}", to_base36(hash.unsigned_abs()))
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

// ────────────────────────────────────────────────────────────────────────────
// ScriptedProbe
// ────────────────────────────────────────────────────────────────────────────

/// Probe that replays a queue of vitals.  Once the queue is down to its last
/// entry that entry is returned forever.
pub struct ScriptedProbe {
    device_id: String,
    capabilities: DeviceCapabilities,
    script: Mutex<VecDeque<RealTimeStats>>,
}

impl ScriptedProbe {
    pub fn new(device_id: &str, initial: RealTimeStats) -> Self {
        Self {
            device_id: device_id.to_string(),
            capabilities: DeviceCapabilities {
                cpu_cores: 4,
                memory_mb: 8_192,
                has_battery: true,
            },
            script: Mutex::new(VecDeque::from([initial])),
        }
    }

    /// Queue `stats` to be returned after everything already queued.
    pub fn push(&self, stats: RealTimeStats) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(stats);
        }
    }

    /// Drop everything queued and return `stats` from now on.
    pub fn set(&self, stats: RealTimeStats) {
        if let Ok(mut script) = self.script.lock() {
            script.clear();
            script.push_back(stats);
        }
    }
}

impl EnvironmentProbe for ScriptedProbe {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    fn stats(&self) -> RealTimeStats {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        let mut stats = next.unwrap_or_else(|| RealTimeStats {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            battery_level: 100.0,
            is_charging: true,
            temperature_c: 25.0,
            timestamp: Utc::now(),
        });
        stats.timestamp = Utc::now();
        stats
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}
