//! Host vitals read from procfs and sysfs.
//!
//! Missing files are not errors: a machine without a battery reports mains
//! power at 100 %, and one without thermal zones reports a cool reading.

use std::fs;
use std::path::{Path, PathBuf};

use tidepool_kernel::{DeviceSignals, EnvironmentProbe, device_id};
use tidepool_types::{DeviceCapabilities, RealTimeStats};

const FALLBACK_TEMPERATURE_C: f64 = 35.0;

/// [`EnvironmentProbe`] backed by `/proc` and `/sys`.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    root: PathBuf,
    cores: u32,
    device_id: String,
}

impl SysfsProbe {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Probe a different filesystem root.  Tests point this at a temp dir.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let device_id = device_id(&host_signals(&root));
        Self {
            root,
            cores,
            device_id,
        }
    }

    fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root.join(rel)).ok()
    }

    fn meminfo(&self) -> Option<MemInfo> {
        self.read("proc/meminfo").as_deref().and_then(parse_meminfo)
    }

    fn power(&self) -> PowerState {
        read_power(&self.root.join("sys/class/power_supply"))
    }

    fn temperature(&self) -> f64 {
        let dir = self.root.join("sys/class/thermal");
        let Ok(entries) = fs::read_dir(dir) else {
            return FALLBACK_TEMPERATURE_C;
        };
        entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("thermal_zone"))
            .filter_map(|e| fs::read_to_string(e.path().join("temp")).ok())
            .filter_map(|raw| parse_millidegrees(&raw))
            .reduce(f64::max)
            .unwrap_or(FALLBACK_TEMPERATURE_C)
    }
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentProbe for SysfsProbe {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            cpu_cores: self.cores,
            memory_mb: self.meminfo().map(|m| m.total_kb / 1024).unwrap_or(0),
            has_battery: self.power().battery_level.is_some(),
        }
    }

    fn stats(&self) -> RealTimeStats {
        let cpu_usage = self
            .read("proc/loadavg")
            .as_deref()
            .and_then(parse_loadavg)
            .map(|load| (load / f64::from(self.cores.max(1)) * 100.0).clamp(0.0, 100.0))
            .unwrap_or(0.0);
        let memory_usage = self.meminfo().map(|m| m.used_percent()).unwrap_or(0.0);
        let power = self.power();
        RealTimeStats {
            cpu_usage,
            memory_usage,
            battery_level: power.battery_level.unwrap_or(100.0),
            is_charging: power.battery_level.is_none() || power.charging,
            temperature_c: self.temperature(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

fn host_signals(root: &Path) -> DeviceSignals {
    let machine = fs::read_to_string(root.join("etc/machine-id"))
        .or_else(|_| fs::read_to_string(root.join("etc/hostname")))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    DeviceSignals {
        user_agent: format!(
            "tidepool/{} ({}; {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        ),
        locale: std::env::var("LANG").unwrap_or_default(),
        screen_width: 0,
        screen_height: 0,
        timezone_offset_minutes: chrono::Local::now().offset().local_minus_utc() / 60,
        render_signature: machine,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MemInfo {
    total_kb: u64,
    available_kb: u64,
}

impl MemInfo {
    fn used_percent(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        let used = self.total_kb.saturating_sub(self.available_kb);
        used as f64 / self.total_kb as f64 * 100.0
    }
}

fn parse_meminfo(raw: &str) -> Option<MemInfo> {
    let field = |name: &str| {
        raw.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
    };
    let total_kb = field("MemTotal")?;
    let available_kb = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some(MemInfo {
        total_kb,
        available_kb,
    })
}

/// One-minute load average, the first field of `/proc/loadavg`.
fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

fn parse_millidegrees(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().map(|m| m / 1000.0)
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct PowerState {
    battery_level: Option<f64>,
    charging: bool,
}

fn read_power(dir: &Path) -> PowerState {
    let mut state = PowerState::default();
    let Ok(entries) = fs::read_dir(dir) else {
        return state;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let read = |f: &str| fs::read_to_string(path.join(f)).map(|s| s.trim().to_string());
        match read("type").as_deref() {
            Ok("Battery") => {
                if state.battery_level.is_none()
                    && let Ok(capacity) = read("capacity")
                {
                    state.battery_level = capacity.parse().ok();
                }
                if matches!(read("status").as_deref(), Ok("Charging") | Ok("Full")) {
                    state.charging = true;
                }
            }
            Ok("Mains") => {
                if matches!(read("online").as_deref(), Ok("1")) {
                    state.charging = true;
                }
            }
            _ => {}
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn parses_meminfo_usage() {
        let raw = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        let info = parse_meminfo(raw).unwrap();
        assert_eq!(info.total_kb, 1000);
        assert_eq!(info.available_kb, 250);
        assert!((info.used_percent() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn parses_loadavg_and_millidegrees() {
        assert_eq!(parse_loadavg("0.50 0.40 0.30 1/100 42\n"), Some(0.5));
        assert_eq!(parse_loadavg(""), None);
        assert_eq!(parse_millidegrees("47500\n"), Some(47.5));
    }

    #[test]
    fn empty_root_falls_back_to_mains_and_cool() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SysfsProbe::with_root(dir.path());
        let stats = probe.stats();
        assert_eq!(stats.battery_level, 100.0);
        assert!(stats.is_charging);
        assert_eq!(stats.temperature_c, FALLBACK_TEMPERATURE_C);
        assert_eq!(stats.cpu_usage, 0.0);
        assert!(!probe.capabilities().has_battery);
    }

    #[test]
    fn reads_battery_and_hottest_zone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "sys/class/power_supply/BAT0/type", "Battery\n");
        write(root, "sys/class/power_supply/BAT0/capacity", "42\n");
        write(root, "sys/class/power_supply/BAT0/status", "Discharging\n");
        write(root, "sys/class/power_supply/AC/type", "Mains\n");
        write(root, "sys/class/power_supply/AC/online", "0\n");
        write(root, "sys/class/thermal/thermal_zone0/temp", "41000\n");
        write(root, "sys/class/thermal/thermal_zone1/temp", "52000\n");
        write(root, "proc/meminfo", "MemTotal: 2048 kB\nMemAvailable: 1024 kB\n");

        let probe = SysfsProbe::with_root(root);
        let stats = probe.stats();
        assert_eq!(stats.battery_level, 42.0);
        assert!(!stats.is_charging);
        assert_eq!(stats.temperature_c, 52.0);
        assert!((stats.memory_usage - 50.0).abs() < 1e-9);
        let caps = probe.capabilities();
        assert!(caps.has_battery);
        assert_eq!(caps.memory_mb, 2);
    }

    #[test]
    fn mains_online_counts_as_charging() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "sys/class/power_supply/BAT0/type", "Battery\n");
        write(root, "sys/class/power_supply/BAT0/capacity", "80\n");
        write(root, "sys/class/power_supply/AC/type", "Mains\n");
        write(root, "sys/class/power_supply/AC/online", "1\n");
        assert!(SysfsProbe::with_root(root).stats().is_charging);
    }

    #[test]
    fn device_id_is_stable_per_machine() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "etc/machine-id", "abc123\n");
        let a = SysfsProbe::with_root(dir.path()).device_id();
        let b = SysfsProbe::with_root(dir.path()).device_id();
        assert_eq!(a, b);
        assert!(a.starts_with("device_"));
    }
}
