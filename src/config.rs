//! Performance presets governing batching and upload cadence.

use std::time::Duration;

/// Tuning knobs for the storage and upload pipelines of one feature.
///
/// The SDK-level preset is the default for every feature; a feature may carry
/// a [`PerformanceOverride`] that is merged over it at registration.
#[derive(Clone, Debug, PartialEq)]
pub struct PerformancePreset {
    /// Byte cap above which a new batch file opens.
    pub max_file_size: u64,
    /// Per-event byte cap; larger events are dropped with telemetry.
    pub max_object_size: u64,
    /// Event count cap per batch file.
    pub max_objects_in_file: usize,
    /// Age above which the current file is closed on the next write.
    pub max_file_age_for_write: Duration,
    /// Minimum age before a closed file becomes eligible for upload.
    pub min_file_age_for_read: Duration,
    /// Age above which a file is considered obsolete and deleted unread.
    pub max_file_age_for_read: Duration,
    /// Total byte cap per feature; oldest files are evicted first.
    pub max_directory_size: u64,
    /// Delay before the first upload tick.
    pub initial_upload_delay: Duration,
    pub min_upload_delay: Duration,
    pub max_upload_delay: Duration,
    /// Fractional rate applied to the delay after each tick: multiplied by
    /// `1 - rate` on success, `1 + rate` on a retryable failure.
    pub upload_delay_change_rate: f64,
    /// Keep uploading while the device reports low-power mode.
    pub low_power_override: bool,
}

impl Default for PerformancePreset {
    fn default() -> Self {
        Self {
            max_file_size: 4 * 1024 * 1024,
            max_object_size: 512 * 1024,
            max_objects_in_file: 500,
            max_file_age_for_write: Duration::from_millis(4_750),
            min_file_age_for_read: Duration::from_millis(8_500),
            max_file_age_for_read: Duration::from_secs(18 * 60 * 60),
            max_directory_size: 512 * 1024 * 1024,
            initial_upload_delay: Duration::from_secs(5),
            min_upload_delay: Duration::from_secs(1),
            max_upload_delay: Duration::from_secs(20),
            upload_delay_change_rate: 0.1,
            low_power_override: false,
        }
    }
}

/// Per-feature overrides, merged over the SDK preset at registration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerformanceOverride {
    pub max_file_size: Option<u64>,
    pub max_object_size: Option<u64>,
    pub max_objects_in_file: Option<usize>,
    pub max_file_age_for_write: Option<Duration>,
    pub min_file_age_for_read: Option<Duration>,
    pub max_file_age_for_read: Option<Duration>,
    pub max_directory_size: Option<u64>,
    pub initial_upload_delay: Option<Duration>,
    pub min_upload_delay: Option<Duration>,
    pub max_upload_delay: Option<Duration>,
    pub upload_delay_change_rate: Option<f64>,
    pub low_power_override: Option<bool>,
}

impl PerformanceOverride {
    /// Produce the effective preset for a feature.
    pub fn apply(&self, preset: &PerformancePreset) -> PerformancePreset {
        PerformancePreset {
            max_file_size: self.max_file_size.unwrap_or(preset.max_file_size),
            max_object_size: self.max_object_size.unwrap_or(preset.max_object_size),
            max_objects_in_file: self.max_objects_in_file.unwrap_or(preset.max_objects_in_file),
            max_file_age_for_write: self
                .max_file_age_for_write
                .unwrap_or(preset.max_file_age_for_write),
            min_file_age_for_read: self
                .min_file_age_for_read
                .unwrap_or(preset.min_file_age_for_read),
            max_file_age_for_read: self
                .max_file_age_for_read
                .unwrap_or(preset.max_file_age_for_read),
            max_directory_size: self.max_directory_size.unwrap_or(preset.max_directory_size),
            initial_upload_delay: self
                .initial_upload_delay
                .unwrap_or(preset.initial_upload_delay),
            min_upload_delay: self.min_upload_delay.unwrap_or(preset.min_upload_delay),
            max_upload_delay: self.max_upload_delay.unwrap_or(preset.max_upload_delay),
            upload_delay_change_rate: self
                .upload_delay_change_rate
                .unwrap_or(preset.upload_delay_change_rate),
            low_power_override: self.low_power_override.unwrap_or(preset.low_power_override),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_merges_over_preset() {
        let preset = PerformancePreset::default();
        let overrides = PerformanceOverride {
            max_file_size: Some(1024),
            min_upload_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };

        let effective = overrides.apply(&preset);
        assert_eq!(effective.max_file_size, 1024);
        assert_eq!(effective.min_upload_delay, Duration::from_millis(100));
        assert_eq!(effective.max_object_size, preset.max_object_size);
        assert_eq!(effective.max_upload_delay, preset.max_upload_delay);
    }

    #[test]
    fn empty_override_is_identity() {
        let preset = PerformancePreset::default();
        assert_eq!(PerformanceOverride::default().apply(&preset), preset);
    }
}
