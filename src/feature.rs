//! Input features: an id, a geometry and free-form properties

use std::ops::Index;
use std::sync::Arc;

use geo::{CoordsIter, Geometry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single vector feature.
///
/// Immutable once it has been handed to a job; the job only ever reads it
/// through a shared [`FeatureSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Feature identifier, unique within its set
    pub id: String,
    /// Feature geometry, already in the job's coordinate reference system
    pub geometry: Geometry<f64>,
    /// Arbitrary attribute mapping
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Feature {
    /// Feature with no properties
    pub fn new(id: impl Into<String>, geometry: Geometry<f64>) -> Self {
        Self {
            id: id.into(),
            geometry,
            properties: Map::new(),
        }
    }

    /// Attach a property
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// First coordinate problem found in the geometry, if any.
    ///
    /// Only checks that every coordinate is finite; topological validity is a
    /// per-pair concern of the overlay computer.
    pub fn coordinate_problem(&self) -> Option<String> {
        self.geometry
            .coords_iter()
            .position(|c| !c.x.is_finite() || !c.y.is_finite())
            .map(|position| format!("non-finite coordinate at position {position}"))
    }
}

/// Ordered, index-addressed collection of features.
///
/// Insertion order defines the index space used for pairing; the backing
/// storage is shared so batches reference it instead of copying.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet {
    features: Arc<Vec<Feature>>,
}

impl FeatureSet {
    /// Empty feature set
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// True when the set holds no features
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Feature at `index`
    pub fn get(&self, index: usize) -> Option<&Feature> {
        self.features.get(index)
    }

    /// Iterate in index order
    pub fn iter(&self) -> std::slice::Iter<'_, Feature> {
        self.features.iter()
    }
}

impl From<Vec<Feature>> for FeatureSet {
    fn from(features: Vec<Feature>) -> Self {
        Self {
            features: Arc::new(features),
        }
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl Index<usize> for FeatureSet {
    type Output = Feature;

    fn index(&self, index: usize) -> &Self::Output {
        &self.features[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};
    use serde_json::json;

    #[test]
    fn test_feature_set_preserves_order() {
        let set: FeatureSet = (0..3)
            .map(|i| Feature::new(format!("f{i}"), Geometry::Point(point!(x: i as f64, y: 0.0))))
            .collect();

        assert_eq!(set.len(), 3);
        assert_eq!(set[1].id, "f1");
        assert_eq!(set.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(), ["f0", "f1", "f2"]);
    }

    #[test]
    fn test_clones_share_storage() {
        let set = FeatureSet::from(vec![Feature::new("a", Geometry::Point(point!(x: 0.0, y: 0.0)))]);
        let other = set.clone();
        assert!(Arc::ptr_eq(&set.features, &other.features));
    }

    #[test]
    fn test_coordinate_problem_detects_nan() {
        let ok = Feature::new(
            "ok",
            Geometry::Polygon(polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)]),
        )
        .with_property("zone", json!("R1"));
        assert!(ok.coordinate_problem().is_none());
        assert_eq!(ok.properties["zone"], json!("R1"));

        let bad = Feature::new("bad", Geometry::Point(point!(x: f64::NAN, y: 0.0)));
        assert!(bad.coordinate_problem().is_some());
    }
}
