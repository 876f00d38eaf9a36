//! Conformance run settings
//!
//! Tolerances, timeouts and feature toggles for a telescope run. Persisted as
//! JSON; every field has a default so partial files load cleanly.

use crate::error::{ConformError, ConformResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-method toggles for the method phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodTests {
    pub abort_slew: bool,
    pub axis_rates: bool,
    pub can_move_axis: bool,
    pub destination_side_of_pier: bool,
    pub find_home: bool,
    pub move_axis: bool,
    pub park_unpark: bool,
    pub pulse_guide: bool,
    pub side_of_pier_read: bool,
    pub side_of_pier_write: bool,
    pub slew_to_alt_az: bool,
    pub slew_to_alt_az_async: bool,
    pub slew_to_coordinates: bool,
    pub slew_to_coordinates_async: bool,
    pub slew_to_target: bool,
    pub slew_to_target_async: bool,
    pub sync_to_alt_az: bool,
    pub sync_to_coordinates: bool,
    pub sync_to_target: bool,
}

impl Default for MethodTests {
    fn default() -> Self {
        Self {
            abort_slew: true,
            axis_rates: true,
            can_move_axis: true,
            destination_side_of_pier: true,
            find_home: true,
            move_axis: true,
            park_unpark: true,
            pulse_guide: true,
            side_of_pier_read: true,
            side_of_pier_write: true,
            slew_to_alt_az: true,
            slew_to_alt_az_async: true,
            slew_to_coordinates: true,
            slew_to_coordinates_async: true,
            slew_to_target: true,
            slew_to_target_async: true,
            sync_to_alt_az: true,
            sync_to_coordinates: true,
            sync_to_target: true,
        }
    }
}

impl MethodTests {
    /// Names of method groups switched off, for the configuration report
    pub fn disabled(&self) -> Vec<&'static str> {
        let toggles = [
            ("AbortSlew", self.abort_slew),
            ("AxisRates", self.axis_rates),
            ("CanMoveAxis", self.can_move_axis),
            ("DestinationSideOfPier", self.destination_side_of_pier),
            ("FindHome", self.find_home),
            ("MoveAxis", self.move_axis),
            ("Park/Unpark", self.park_unpark),
            ("PulseGuide", self.pulse_guide),
            ("SideOfPier Read", self.side_of_pier_read),
            ("SideOfPier Write", self.side_of_pier_write),
            ("SlewToAltAz", self.slew_to_alt_az),
            ("SlewToAltAzAsync", self.slew_to_alt_az_async),
            ("SlewToCoordinates", self.slew_to_coordinates),
            ("SlewToCoordinatesAsync", self.slew_to_coordinates_async),
            ("SlewToTarget", self.slew_to_target),
            ("SlewToTargetAsync", self.slew_to_target_async),
            ("SyncToAltAz", self.sync_to_alt_az),
            ("SyncToCoordinates", self.sync_to_coordinates),
            ("SyncToTarget", self.sync_to_target),
        ];
        toggles
            .iter()
            .filter(|(_, enabled)| !enabled)
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Settings for a telescope conformance run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelescopeSettings {
    /// Allowed pointing error after a slew or sync, arcseconds
    pub slew_tolerance_arcsec: f64,
    /// Allowed displacement error after a pulse guide, arcseconds
    pub pulse_guide_tolerance_arcsec: f64,
    /// Longest a slew, park or home may take
    pub maximum_slew_time_secs: f64,
    /// Async operations are treated as busy for at least this long
    pub slew_minimum_duration_secs: f64,
    /// How long Slewing may stay true after motion is stopped
    pub time_for_slewing_to_become_false_secs: f64,
    /// Interval between completion polls
    pub poll_interval_ms: u64,
    /// Larger rate offset used by the offset measurement, arcseconds per second
    pub rate_offset_high_arcsec_per_sec: f64,
    /// Smaller rate offset used by the offset measurement, arcseconds per second
    pub rate_offset_low_arcsec_per_sec: f64,
    /// Measurement window for each rate offset
    pub rate_offset_duration_secs: f64,
    /// Pulse length for the extended pulse guide test
    pub pulse_guide_duration_ms: u32,
    /// Duration of each performance sample
    pub performance_sample_secs: f64,

    /// Read Target* before they are ever written and expect a rejection
    pub first_use_tests: bool,
    /// Write a different legal site value and read it back
    pub extended_site_tests: bool,
    /// Measure actual motion under RightAscensionRate/DeclinationRate offsets
    pub extended_rate_offset_tests: bool,
    /// Measure actual displacement for each pulse guide direction
    pub extended_pulse_guide_tests: bool,
    /// Allow SetPark to overwrite the device's park position
    pub allow_set_park: bool,

    pub test_properties: bool,
    pub test_methods: bool,
    pub test_performance: bool,
    pub methods: MethodTests,
}

impl Default for TelescopeSettings {
    fn default() -> Self {
        Self {
            slew_tolerance_arcsec: 10.0,
            pulse_guide_tolerance_arcsec: 10.0,
            maximum_slew_time_secs: 300.0,
            slew_minimum_duration_secs: 5.0,
            time_for_slewing_to_become_false_secs: 5.0,
            poll_interval_ms: 500,
            rate_offset_high_arcsec_per_sec: 2.0,
            rate_offset_low_arcsec_per_sec: 0.2,
            rate_offset_duration_secs: 10.0,
            pulse_guide_duration_ms: 5000,
            performance_sample_secs: 5.0,
            first_use_tests: true,
            extended_site_tests: false,
            extended_rate_offset_tests: false,
            extended_pulse_guide_tests: false,
            allow_set_park: false,
            test_properties: true,
            test_methods: true,
            test_performance: false,
            methods: MethodTests::default(),
        }
    }
}

impl TelescopeSettings {
    pub fn from_json(json: &str) -> ConformResult<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| ConformError::Settings(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> ConformResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConformError::Settings(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ConformResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConformError::Settings(format!("Failed to serialize settings: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| ConformError::Settings(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> ConformResult<()> {
        let positive = [
            ("slew_tolerance_arcsec", self.slew_tolerance_arcsec),
            ("pulse_guide_tolerance_arcsec", self.pulse_guide_tolerance_arcsec),
            ("maximum_slew_time_secs", self.maximum_slew_time_secs),
            ("rate_offset_duration_secs", self.rate_offset_duration_secs),
            ("performance_sample_secs", self.performance_sample_secs),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConformError::Settings(format!("{} must be greater than zero, got {}", name, value)));
            }
        }

        let non_negative = [
            ("slew_minimum_duration_secs", self.slew_minimum_duration_secs),
            ("time_for_slewing_to_become_false_secs", self.time_for_slewing_to_become_false_secs),
            ("rate_offset_high_arcsec_per_sec", self.rate_offset_high_arcsec_per_sec),
            ("rate_offset_low_arcsec_per_sec", self.rate_offset_low_arcsec_per_sec),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConformError::Settings(format!("{} must not be negative, got {}", name, value)));
            }
        }

        if self.poll_interval_ms == 0 {
            return Err(ConformError::Settings("poll_interval_ms must be greater than zero".to_string()));
        }
        if self.pulse_guide_duration_ms == 0 {
            return Err(ConformError::Settings("pulse_guide_duration_ms must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn maximum_slew_time(&self) -> Duration {
        Duration::from_secs_f64(self.maximum_slew_time_secs)
    }

    pub fn slew_minimum_duration(&self) -> Duration {
        Duration::from_secs_f64(self.slew_minimum_duration_secs)
    }

    pub fn time_for_slewing_to_become_false(&self) -> Duration {
        Duration::from_secs_f64(self.time_for_slewing_to_become_false_secs)
    }

    pub fn rate_offset_duration(&self) -> Duration {
        Duration::from_secs_f64(self.rate_offset_duration_secs)
    }

    pub fn performance_sample(&self) -> Duration {
        Duration::from_secs_f64(self.performance_sample_secs)
    }

    /// Disabled test groups, one line each, for the configuration report
    pub fn disabled_groups(&self) -> Vec<String> {
        let mut groups = Vec::new();
        if !self.test_properties {
            groups.push("Property tests".to_string());
        }
        if !self.test_methods {
            groups.push("Method tests".to_string());
        } else {
            groups.extend(self.methods.disabled().into_iter().map(|m| format!("{} method test", m)));
        }
        if !self.test_performance {
            groups.push("Performance tests".to_string());
        }
        if !self.first_use_tests {
            groups.push("First use tests".to_string());
        }
        if !self.extended_site_tests {
            groups.push("Extended site property tests".to_string());
        }
        if !self.extended_rate_offset_tests {
            groups.push("Extended rate offset tests".to_string());
        }
        if !self.extended_pulse_guide_tests {
            groups.push("Extended pulse guide tests".to_string());
        }
        if !self.allow_set_park {
            groups.push("SetPark (park position left unchanged)".to_string());
        }
        groups
    }

    /// Short timings for simulator-backed unit tests
    #[cfg(test)]
    pub(crate) fn fast_for_tests() -> Self {
        Self {
            maximum_slew_time_secs: 5.0,
            slew_minimum_duration_secs: 0.0,
            time_for_slewing_to_become_false_secs: 1.0,
            poll_interval_ms: 10,
            rate_offset_duration_secs: 0.3,
            rate_offset_high_arcsec_per_sec: 200.0,
            rate_offset_low_arcsec_per_sec: 20.0,
            pulse_guide_duration_ms: 200,
            performance_sample_secs: 0.05,
            ..Self::default()
        }
    }
}
