use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use simwatch_core::range::ValueRange;
use simwatch_core::types::{meta_keys, Metadata, PlotAttributes};

pub const STATS_FILE: &str = "stats.json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantityStats {
    pub min: f64,
    pub max: f64,
}

/// What a container says about its contents: how each variable is plotted and
/// the value range of every stored quantity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    #[serde(default)]
    pub attributes: BTreeMap<String, PlotAttributes>,
    #[serde(default)]
    pub variables: BTreeMap<String, QuantityStats>,
}

impl ContainerSummary {
    fn quantity(&self, name: &str) -> Option<ValueRange> {
        self.variables
            .get(name)
            .map(|q| ValueRange::new(q.min, q.max))
    }
}

/// Reads range information out of an unpacked container directory.
///
/// `Ok(None)` means the container carries no range data.
pub trait ContainerInspector: Send + Sync + 'static {
    fn inspect(&self, container_dir: &Path) -> Result<Option<ContainerSummary>>;
}

/// Reads `<container>/stats.json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStatsInspector;

impl ContainerInspector for JsonStatsInspector {
    fn inspect(&self, container_dir: &Path) -> Result<Option<ContainerSummary>> {
        let path = container_dir.join(STATS_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let summary = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(summary))
    }
}

fn stored_range(meta: &Metadata, key: &str) -> ValueRange {
    meta.get(key)
        .and_then(ValueRange::from_json)
        .unwrap_or(ValueRange::EMPTY)
}

fn widen_key(
    patch: &mut Metadata,
    current: &Metadata,
    key: &str,
    samples: impl IntoIterator<Item = ValueRange>,
) {
    let widened = samples
        .into_iter()
        .fold(stored_range(current, key), ValueRange::widen_with);
    if !widened.is_empty() {
        patch.insert(key.to_string(), widened.to_json());
    }
}

/// Metadata keys to write for `variable` given the container `summary` and the
/// item's `current` metadata. `None` when the container does not describe the
/// variable.
///
/// Quantities named by the plot attributes but absent from the container are
/// ignored.
pub fn range_patch(
    summary: &ContainerSummary,
    variable: &str,
    current: &Metadata,
) -> Option<Metadata> {
    let attrs = summary.attributes.get(variable)?;
    let mut patch = Metadata::new();

    if attrs.has_axes() {
        let x = attrs.x.as_deref().and_then(|name| summary.quantity(name));
        widen_key(&mut patch, current, meta_keys::X_RANGE, x);
        let ys = attrs
            .y_names()
            .into_iter()
            .filter_map(|name| summary.quantity(name))
            .collect::<Vec<_>>();
        widen_key(&mut patch, current, meta_keys::Y_RANGE, ys);
    }
    if let Some(color) = attrs.color.as_deref() {
        widen_key(
            &mut patch,
            current,
            meta_keys::COLOR_RANGE,
            summary.quantity(color),
        );
    }
    Some(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary() -> ContainerSummary {
        serde_json::from_value(json!({
            "attributes": {
                "density": {"type": "line", "x": "r", "y": ["ne", "ni"]},
                "psi": {"type": "mesh-colormap", "color": "psi_val"},
                "temp": {"type": "colormap", "x": "r", "y": "z", "color": "te"}
            },
            "variables": {
                "r": {"min": 0.0, "max": 1.0},
                "ne": {"min": -2.0, "max": 3.0},
                "ni": {"min": -5.0, "max": 1.0},
                "z": {"min": 4.0, "max": 6.0},
                "te": {"min": 10.0, "max": 20.0},
                "psi_val": {"min": 0.5, "max": 0.7}
            }
        }))
        .unwrap()
    }

    #[test]
    fn line_plot_widens_x_and_every_y() {
        let mut current = Metadata::new();
        current.insert("x_range".into(), json!([-1.0, 0.5]));
        let patch = range_patch(&summary(), "density", &current).unwrap();
        assert_eq!(patch.get("x_range"), Some(&json!([-1.0, 1.0])));
        assert_eq!(patch.get("y_range"), Some(&json!([-5.0, 3.0])));
        assert!(!patch.contains_key("color_range"));
    }

    #[test]
    fn mesh_colormap_only_tracks_color() {
        let patch = range_patch(&summary(), "psi", &Metadata::new()).unwrap();
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get("color_range"), Some(&json!([0.5, 0.7])));
    }

    #[test]
    fn scalar_y_and_color() {
        let patch = range_patch(&summary(), "temp", &Metadata::new()).unwrap();
        assert_eq!(patch.get("y_range"), Some(&json!([4.0, 6.0])));
        assert_eq!(patch.get("color_range"), Some(&json!([10.0, 20.0])));
    }

    #[test]
    fn unknown_variable_and_missing_quantities() {
        assert!(range_patch(&summary(), "nope", &Metadata::new()).is_none());

        let mut s = summary();
        s.variables.remove("r");
        let patch = range_patch(&s, "density", &Metadata::new()).unwrap();
        assert!(!patch.contains_key("x_range"));
        assert!(patch.contains_key("y_range"));
    }

    #[test]
    fn inspector_reads_stats_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(JsonStatsInspector.inspect(dir.path())?.is_none());
        std::fs::write(
            dir.path().join(STATS_FILE),
            serde_json::to_vec(&summary())?,
        )?;
        let got = JsonStatsInspector.inspect(dir.path())?;
        assert_eq!(got, Some(summary()));
        Ok(())
    }
}
