use crate::entities::datasets::SensorKind;
use std::collections::HashMap;

/// One registered converter. Adding a sensor is a data-only change: a new
/// record here, no dispatcher edits.
#[derive(Debug, Clone)]
pub struct ConverterSpec {
    pub sensor: SensorKind,
    /// Executable invoked as `{executable} {input_dir} {output_dir} [params]`.
    pub executable: String,
    pub timeout_minutes: u64,
    /// JSON parameter blob appended as the final argument, for sensors whose
    /// converter is configurable.
    pub extra_params: Option<serde_json::Value>,
}

/// Registry of converters keyed by sensor kind.
#[derive(Debug, Clone, Default)]
pub struct ConverterRegistry {
    converters: HashMap<SensorKind, ConverterSpec>,
}

impl ConverterRegistry {
    /// The stock pipeline set. `OTHER` has no converter on purpose: datasets
    /// tagged with it fail conversion with a recorded reason.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        for (sensor, executable) in [
            (SensorKind::Idx, "convert-idx-passthrough"),
            (SensorKind::Tiff, "convert-tiff-to-idx"),
            (SensorKind::TiffRgb, "convert-tiff-rgb-to-idx"),
            (SensorKind::Hdf5, "convert-hdf5-to-idx"),
            (SensorKind::NetCdf, "convert-netcdf-to-idx"),
            (SensorKind::RgbDrone, "convert-rgb-drone"),
            (SensorKind::MapirDrone, "convert-mapir-drone"),
        ] {
            registry.register(ConverterSpec {
                sensor,
                executable: executable.to_string(),
                timeout_minutes: 120,
                extra_params: None,
            });
        }

        // 4D nexus runs take a parameter blob describing the scan geometry.
        registry.register(ConverterSpec {
            sensor: SensorKind::Nexus4d,
            executable: "convert-4dnexus-to-idx".to_string(),
            timeout_minutes: 120,
            extra_params: Some(serde_json::json!({
                "field": "entry/data/data",
                "compression": "zip",
            })),
        });

        registry
    }

    pub fn register(&mut self, spec: ConverterSpec) {
        self.converters.insert(spec.sensor, spec);
    }

    pub fn get(&self, sensor: SensorKind) -> Option<&ConverterSpec> {
        self.converters.get(&sensor)
    }

    /// Longest registered timeout; the stale-claim threshold must exceed it.
    pub fn max_timeout_minutes(&self) -> u64 {
        self.converters
            .values()
            .map(|c| c.timeout_minutes)
            .max()
            .unwrap_or(0)
    }
}
