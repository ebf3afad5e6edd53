//! Effective-policy resolution and update gating.
//!
//! The agent merges three inputs: the fleet policy received over the control
//! channel, the locally configured policy, and the override mode. The result
//! drives the scheduler interval, the maintenance-window gate, and the
//! version-pin check.

use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use pm_common::version;
use pm_protocol::{PinStrategy, PolicySpec};

/// How local configuration interacts with the fleet policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideMode {
    /// Updates are off no matter what the fleet says.
    Never,
    /// Local policy wins unconditionally.
    Local,
    /// Fleet policy when present, local policy as the fallback.
    #[default]
    Inherit,
}

impl FromStr for OverrideMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "local" => Ok(Self::Local),
            "inherit" => Ok(Self::Inherit),
            other => Err(format!("unknown policy override mode: {other}")),
        }
    }
}

/// Which input produced the effective policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySource {
    Disabled,
    Local,
    Fleet,
    Fallback,
}

impl PolicySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Local => "local",
            Self::Fleet => "fleet",
            Self::Fallback => "fallback",
        }
    }
}

/// Capability interface so the manager can be tested with fixed policies.
pub trait PolicyProvider: Send + Sync {
    fn fleet_policy(&self) -> Option<PolicySpec>;
    fn local_policy(&self) -> PolicySpec;
    fn override_mode(&self) -> OverrideMode;
}

/// Production provider: local policy and mode are fixed at startup, the
/// fleet policy is refreshed by the control channel.
pub struct SharedPolicy {
    fleet: RwLock<Option<PolicySpec>>,
    local: PolicySpec,
    mode: OverrideMode,
}

impl SharedPolicy {
    pub fn new(local: PolicySpec, mode: OverrideMode) -> Self {
        Self {
            fleet: RwLock::new(None),
            local,
            mode,
        }
    }

    pub fn set_fleet(&self, policy: Option<PolicySpec>) {
        *self.fleet.write().unwrap() = policy;
    }
}

impl PolicyProvider for SharedPolicy {
    fn fleet_policy(&self) -> Option<PolicySpec> {
        self.fleet.read().unwrap().clone()
    }

    fn local_policy(&self) -> PolicySpec {
        self.local.clone()
    }

    fn override_mode(&self) -> OverrideMode {
        self.mode
    }
}

/// Load the local policy from `<data>/policy.json`; default (disabled)
/// when the file is absent or unparsable.
pub fn load_local_policy(data_dir: &Path) -> PolicySpec {
    let path = data_dir.join("policy.json");
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Unparsable local policy, ignoring: {e}");
                PolicySpec::default()
            }
        },
        Err(_) => PolicySpec::default(),
    }
}

/// Resolve `(spec, source, enabled)` from the provider's three inputs.
pub fn effective_policy(provider: &dyn PolicyProvider) -> (PolicySpec, PolicySource, bool) {
    match provider.override_mode() {
        OverrideMode::Never => (PolicySpec::default(), PolicySource::Disabled, false),
        OverrideMode::Local => {
            let spec = provider.local_policy();
            let enabled = spec.enabled();
            (spec, PolicySource::Local, enabled)
        }
        OverrideMode::Inherit => match provider.fleet_policy() {
            Some(spec) => {
                let enabled = spec.enabled();
                (spec, PolicySource::Fleet, enabled)
            }
            None => {
                let spec = provider.local_policy();
                let enabled = spec.enabled();
                (spec, PolicySource::Fallback, enabled)
            }
        },
    }
}

/// Is `now` inside the policy's maintenance window? Policies without a
/// window (or with it disabled) always pass.
pub fn is_in_maintenance_window(spec: &PolicySpec, now: DateTime<Utc>) -> bool {
    let Some(window) = &spec.maintenance_window else {
        return true;
    };
    if !window.enabled {
        return true;
    }

    let tz: Tz = window.timezone.parse().unwrap_or(Tz::UTC);
    let local = tz.from_utc_datetime(&now.naive_utc());

    if !window.days_of_week.is_empty() {
        let weekday = local.weekday().num_days_from_sunday() as u8;
        if !window.days_of_week.contains(&weekday) {
            return false;
        }
    }

    let minute = local.hour() * 60 + local.minute();
    let start = window.start_hour as u32 * 60 + window.start_min as u32;
    let end = window.end_hour as u32 * 60 + window.end_min as u32;

    if start <= end {
        minute >= start && minute < end
    } else {
        // Overnight window: [start, 24h) ∪ [0, end).
        minute >= start || minute < end
    }
}

/// May policy move this agent from `current` to `target`?
pub fn is_version_allowed(current: &str, target: &str, spec: &PolicySpec) -> bool {
    if let Some(pin) = &spec.target_version {
        return match (version::parse(target), version::parse(pin)) {
            (Some(t), Some(p)) => t == p,
            _ => target == pin.as_str(),
        };
    }

    let (Some(cur), Some(tgt)) = (version::parse(current), version::parse(target)) else {
        return matches!(spec.version_pin_strategy, PinStrategy::None);
    };

    match spec.version_pin_strategy {
        PinStrategy::None => true,
        PinStrategy::Major => spec.allow_major_upgrade || tgt.major == cur.major,
        PinStrategy::Minor => {
            spec.allow_major_upgrade || (tgt.major == cur.major && tgt.minor == cur.minor)
        }
        PinStrategy::Patch => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_protocol::MaintenanceWindow;

    struct FixedProvider {
        fleet: Option<PolicySpec>,
        local: PolicySpec,
        mode: OverrideMode,
    }

    impl PolicyProvider for FixedProvider {
        fn fleet_policy(&self) -> Option<PolicySpec> {
            self.fleet.clone()
        }
        fn local_policy(&self) -> PolicySpec {
            self.local.clone()
        }
        fn override_mode(&self) -> OverrideMode {
            self.mode
        }
    }

    fn spec(days: u32) -> PolicySpec {
        PolicySpec {
            update_check_days: days,
            ..Default::default()
        }
    }

    #[test]
    fn never_mode_disables_everything() {
        let provider = FixedProvider {
            fleet: Some(spec(7)),
            local: spec(1),
            mode: OverrideMode::Never,
        };
        let (_, source, enabled) = effective_policy(&provider);
        assert_eq!(source, PolicySource::Disabled);
        assert!(!enabled);
    }

    #[test]
    fn local_mode_ignores_fleet() {
        let provider = FixedProvider {
            fleet: Some(spec(7)),
            local: spec(0),
            mode: OverrideMode::Local,
        };
        let (got, source, enabled) = effective_policy(&provider);
        assert_eq!(source, PolicySource::Local);
        assert_eq!(got.update_check_days, 0);
        assert!(!enabled);
    }

    #[test]
    fn inherit_prefers_fleet_then_falls_back() {
        let provider = FixedProvider {
            fleet: Some(spec(7)),
            local: spec(1),
            mode: OverrideMode::Inherit,
        };
        let (got, source, enabled) = effective_policy(&provider);
        assert_eq!(source, PolicySource::Fleet);
        assert_eq!(got.update_check_days, 7);
        assert!(enabled);

        let provider = FixedProvider {
            fleet: None,
            local: spec(1),
            mode: OverrideMode::Inherit,
        };
        let (_, source, enabled) = effective_policy(&provider);
        assert_eq!(source, PolicySource::Fallback);
        assert!(enabled);
    }

    fn window(start: (u8, u8), end: (u8, u8)) -> PolicySpec {
        PolicySpec {
            update_check_days: 1,
            maintenance_window: Some(MaintenanceWindow {
                enabled: true,
                timezone: "UTC".into(),
                days_of_week: Default::default(),
                start_hour: start.0,
                start_min: start.1,
                end_hour: end.0,
                end_min: end.1,
            }),
            ..Default::default()
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        // 2026-03-04 is a Wednesday.
        Utc.with_ymd_and_hms(2026, 3, 4, hour, minute, 0).unwrap()
    }

    #[test]
    fn no_window_always_passes() {
        assert!(is_in_maintenance_window(&spec(1), at(12, 0)));

        let mut disabled = window((2, 0), (6, 0));
        disabled.maintenance_window.as_mut().unwrap().enabled = false;
        assert!(is_in_maintenance_window(&disabled, at(12, 0)));
    }

    #[test]
    fn daytime_window_is_half_open() {
        let spec = window((2, 0), (6, 0));
        assert!(!is_in_maintenance_window(&spec, at(1, 59)));
        assert!(is_in_maintenance_window(&spec, at(2, 0)));
        assert!(is_in_maintenance_window(&spec, at(5, 59)));
        assert!(!is_in_maintenance_window(&spec, at(6, 0)));
    }

    #[test]
    fn overnight_window_is_the_union() {
        let spec = window((22, 0), (6, 0));
        assert!(is_in_maintenance_window(&spec, at(23, 30)));
        assert!(is_in_maintenance_window(&spec, at(0, 0)));
        assert!(is_in_maintenance_window(&spec, at(5, 59)));
        assert!(!is_in_maintenance_window(&spec, at(6, 0)));
        assert!(!is_in_maintenance_window(&spec, at(12, 0)));
        assert!(is_in_maintenance_window(&spec, at(22, 0)));
    }

    #[test]
    fn weekday_filter_applies_in_window_timezone() {
        let mut spec = window((0, 0), (23, 59));
        // 3 = Wednesday.
        spec.maintenance_window
            .as_mut()
            .unwrap()
            .days_of_week
            .insert(3);
        assert!(is_in_maintenance_window(&spec, at(12, 0)));

        spec.maintenance_window.as_mut().unwrap().days_of_week =
            [5u8].into_iter().collect();
        assert!(!is_in_maintenance_window(&spec, at(12, 0)));
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let mut spec = window((2, 0), (6, 0));
        spec.maintenance_window.as_mut().unwrap().timezone = "Not/AZone".into();
        assert!(is_in_maintenance_window(&spec, at(3, 0)));
    }

    #[test]
    fn exact_pin_beats_strategy() {
        let spec = PolicySpec {
            target_version: Some("1.5.0".into()),
            version_pin_strategy: PinStrategy::Patch,
            ..Default::default()
        };
        assert!(is_version_allowed("1.0.0", "1.5.0", &spec));
        assert!(!is_version_allowed("1.0.0", "1.5.1", &spec));
    }

    #[test]
    fn pin_strategies() {
        let mut spec = PolicySpec {
            version_pin_strategy: PinStrategy::Major,
            ..Default::default()
        };
        assert!(is_version_allowed("1.9.0", "1.10.0", &spec));
        assert!(!is_version_allowed("1.9.0", "2.0.0", &spec));
        spec.allow_major_upgrade = true;
        assert!(is_version_allowed("1.9.0", "2.0.0", &spec));

        spec.allow_major_upgrade = false;
        spec.version_pin_strategy = PinStrategy::Minor;
        assert!(is_version_allowed("1.2.3", "1.2.9", &spec));
        assert!(!is_version_allowed("1.2.3", "1.3.0", &spec));

        spec.version_pin_strategy = PinStrategy::Patch;
        assert!(!is_version_allowed("1.2.3", "1.2.4", &spec));

        spec.version_pin_strategy = PinStrategy::None;
        assert!(is_version_allowed("1.2.3", "9.9.9", &spec));
    }
}
