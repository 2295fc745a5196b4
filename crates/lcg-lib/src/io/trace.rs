//! Recorded traces.
//!
//! The acquisition engine has written three HDF5 layouts over time:
//!
//! * version 0: sibling `Data`, `Metadata` and `Parameters` groups whose nodes are
//!   named `<prefix>-<id>`, run properties on `Misc/Simulation_properties`;
//! * version 1: one dataset per entity under `Data`, entity properties stored as
//!   attributes of the dataset, run properties as in version 0;
//! * version 2: one group per entity under `Entities/<id>` holding `Data` and an
//!   optional `Metadata` dataset, run properties on the `Info` group.
//!
//! Version 2 files carry an explicit `version` attribute on `Info`; older files are
//! told apart by the presence of a top-level `Metadata` group.

use crate::error::TraceError;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaVersion {
    V0,
    V1,
    V2,
}

impl SchemaVersion {
    pub fn number(self) -> i64 {
        match self {
            SchemaVersion::V0 => 0,
            SchemaVersion::V1 => 1,
            SchemaVersion::V2 => 2,
        }
    }
}

impl TryFrom<i64> for SchemaVersion {
    type Error = TraceError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SchemaVersion::V0),
            1 => Ok(SchemaVersion::V1),
            2 => Ok(SchemaVersion::V2),
            other => Err(TraceError::UnsupportedVersion(other)),
        }
    }
}

/// Attribute value attached to an entity or to the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Number(f64),
    Array(Vec<f64>),
    Text(String),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttrValue::Number(value) => Some(*value),
            _ => None,
        }
    }
}

/// One recorded entity (an analog input, a waveform, a neuron model...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntity {
    pub id: u32,
    pub data: Vec<f64>,
    pub name: Option<String>,
    pub units: Option<String>,
    pub metadata: Option<Array2<f64>>,
    pub parameters: Option<Vec<f64>>,
    /// Remaining attributes, keyed by lower-cased name.
    pub attributes: BTreeMap<String, AttrValue>,
}

impl TraceEntity {
    pub fn new(id: u32, data: Vec<f64>) -> Self {
        Self {
            id,
            data,
            name: None,
            units: None,
            metadata: None,
            parameters: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Move `name` and `units` out of the attribute map.
    fn promote_attributes(&mut self) {
        if let Some(AttrValue::Text(name)) = self.attributes.remove("name") {
            self.name = Some(name);
        }
        if let Some(AttrValue::Text(units)) = self.attributes.remove("units") {
            self.units = Some(units);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub dt: f64,
    pub tend: f64,
    pub version: SchemaVersion,
    /// Other run-level attributes, such as `startTimeSec`.
    pub extra: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub entities: Vec<TraceEntity>,
    pub info: RunInfo,
}

impl Recording {
    pub fn entity(&self, id: u32) -> Option<&TraceEntity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn first_with_units(&self, units: &str) -> Option<&TraceEntity> {
        self.entities
            .iter()
            .find(|e| e.units.as_deref() == Some(units))
    }

    pub fn first_named(&self, name: &str) -> Option<&TraceEntity> {
        self.entities
            .iter()
            .find(|e| e.name.as_deref() == Some(name))
    }

    /// Sample times in seconds for a trace of `len` samples.
    pub fn time_axis(&self, len: usize) -> Vec<f64> {
        (0..len).map(|i| i as f64 * self.info.dt).collect()
    }
}

#[cfg(feature = "hdf5")]
pub use h5::{load_trace, write_recording};

#[cfg(feature = "hdf5")]
mod h5 {
    use super::*;
    use hdf5::types::{FixedAscii, FixedUnicode, TypeDescriptor, VarLenAscii, VarLenUnicode};
    use hdf5::{Attribute, Container, File, Group, Location};
    use std::path::Path;

    const SIMULATION_PROPERTIES: &str = "Misc/Simulation_properties";

    /// Load a trace file, whatever its layout.
    pub fn load_trace(path: &Path) -> Result<Recording, TraceError> {
        if !path.exists() {
            return Err(TraceError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let version = SchemaVersion::try_from(detect_version(&file)?)?;
        log::debug!("{}: layout version {}", path.display(), version.number());
        let mut recording = match version {
            SchemaVersion::V0 => read_v0(&file)?,
            SchemaVersion::V1 => read_v1(&file)?,
            SchemaVersion::V2 => read_v2(&file)?,
        };
        recording.entities.sort_by_key(|e| e.id);
        Ok(recording)
    }

    fn detect_version(file: &File) -> Result<i64, TraceError> {
        if file.link_exists("Info") {
            let info = file.group("Info")?;
            if info.attr_names()?.iter().any(|name| name == "version") {
                let values = info.attr("version")?.read_raw::<f64>()?;
                if let Some(version) = values.first() {
                    return Ok(*version as i64);
                }
            }
        }
        Ok(if file.link_exists("Metadata") { 0 } else { 1 })
    }

    fn entity_id(node: &str) -> Result<u32, TraceError> {
        node.split('-')
            .nth(1)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| TraceError::BadEntityName(node.to_string()))
    }

    fn read_v0(file: &File) -> Result<Recording, TraceError> {
        let data = group(file, "Data")?;
        let mut entities = Vec::new();
        let mut index = BTreeMap::new();
        for node in data.member_names()? {
            let id = entity_id(&node)?;
            index.insert(id, entities.len());
            entities.push(TraceEntity::new(id, data.dataset(&node)?.read_raw::<f64>()?));
        }
        let metadata = group(file, "Metadata")?;
        for node in metadata.member_names()? {
            let slot = lookup(&index, &node)?;
            let matrix = read_matrix(&metadata.dataset(&node)?, &node)?;
            entities[slot].metadata = Some(matrix);
        }
        if file.link_exists("Parameters") {
            let parameters = file.group("Parameters")?;
            for node in parameters.member_names()? {
                let slot = lookup(&index, &node)?;
                match parameters.dataset(&node)?.read_raw::<f64>() {
                    Ok(values) => entities[slot].parameters = Some(values),
                    Err(err) => log::debug!("skipping parameters {}: {}", node, err),
                }
            }
        }
        let info = simulation_properties(file, SchemaVersion::V0)?;
        Ok(Recording { entities, info })
    }

    fn read_v1(file: &File) -> Result<Recording, TraceError> {
        let data = group(file, "Data")?;
        let mut entities = Vec::new();
        for node in data.member_names()? {
            let dataset = data.dataset(&node)?;
            let mut entity = TraceEntity::new(entity_id(&node)?, dataset.read_raw::<f64>()?);
            for name in dataset.attr_names()? {
                let attr = dataset.attr(&name)?;
                if name
                    .get(..8)
                    .map_or(false, |prefix| prefix.eq_ignore_ascii_case("metadata"))
                {
                    entity.metadata = Some(read_matrix(&attr, &name)?);
                } else if let Some(value) = read_attr(&attr, &name) {
                    entity.attributes.insert(name.to_lowercase(), value);
                }
            }
            entity.promote_attributes();
            entities.push(entity);
        }
        let info = simulation_properties(file, SchemaVersion::V1)?;
        Ok(Recording { entities, info })
    }

    fn read_v2(file: &File) -> Result<Recording, TraceError> {
        let root = group(file, "Entities")?;
        let mut entities = Vec::new();
        for node in root.member_names()? {
            let id = node
                .parse()
                .map_err(|_| TraceError::BadEntityName(node.clone()))?;
            let entity_group = root.group(&node)?;
            if !entity_group.link_exists("Data") {
                return Err(TraceError::MissingNode(format!("Entities/{}/Data", node)));
            }
            let mut entity =
                TraceEntity::new(id, entity_group.dataset("Data")?.read_raw::<f64>()?);
            if entity_group.link_exists("Metadata") {
                let name = format!("Entities/{}/Metadata", node);
                entity.metadata = Some(read_matrix(&entity_group.dataset("Metadata")?, &name)?);
            }
            for name in entity_group.attr_names()? {
                if let Some(value) = read_attr(&entity_group.attr(&name)?, &name) {
                    entity.attributes.insert(name.to_lowercase(), value);
                }
            }
            entity.promote_attributes();
            entities.push(entity);
        }
        let info = run_info(&group(file, "Info")?, SchemaVersion::V2)?;
        Ok(Recording { entities, info })
    }

    fn group(file: &File, name: &str) -> Result<Group, TraceError> {
        if !file.link_exists(name) {
            return Err(TraceError::MissingNode(name.to_string()));
        }
        Ok(file.group(name)?)
    }

    fn lookup(index: &BTreeMap<u32, usize>, node: &str) -> Result<usize, TraceError> {
        let id = entity_id(node)?;
        index.get(&id).copied().ok_or(TraceError::OrphanNode {
            node: node.to_string(),
            id,
        })
    }

    fn simulation_properties(
        file: &File,
        version: SchemaVersion,
    ) -> Result<RunInfo, TraceError> {
        if !file.link_exists("Misc") {
            return Err(TraceError::MissingNode(SIMULATION_PROPERTIES.to_string()));
        }
        match file.group(SIMULATION_PROPERTIES) {
            Ok(properties) => run_info(&properties, version),
            Err(_) => {
                let properties = file
                    .dataset(SIMULATION_PROPERTIES)
                    .map_err(|_| TraceError::MissingNode(SIMULATION_PROPERTIES.to_string()))?;
                run_info(&properties, version)
            }
        }
    }

    fn run_info(location: &Location, version: SchemaVersion) -> Result<RunInfo, TraceError> {
        let mut dt = None;
        let mut tend = None;
        let mut extra = BTreeMap::new();
        for name in location.attr_names()? {
            let attr = location.attr(&name)?;
            match name.as_str() {
                "dt" => dt = attr.read_raw::<f64>()?.first().copied(),
                "tend" => tend = attr.read_raw::<f64>()?.first().copied(),
                "version" => {}
                _ => {
                    if let Some(value) = read_attr(&attr, &name) {
                        extra.insert(name, value);
                    }
                }
            }
        }
        let missing = |attr: &str| TraceError::MissingNode(format!("{}@{}", location.name(), attr));
        Ok(RunInfo {
            dt: dt.ok_or_else(|| missing("dt"))?,
            tend: tend.ok_or_else(|| missing("tend"))?,
            version,
            extra,
        })
    }

    fn read_matrix(container: &Container, node: &str) -> Result<Array2<f64>, TraceError> {
        let shape = container.shape();
        let values = container.read_raw::<f64>()?;
        let len = values.len();
        let (rows, cols) = match shape.as_slice() {
            [rows, cols] => (*rows, *cols),
            _ => (1, len),
        };
        Array2::from_shape_vec((rows, cols), values).map_err(|_| TraceError::BadMatrix {
            node: node.to_string(),
            len,
            cols,
        })
    }

    /// Decode a scalar or numeric array attribute; other types are skipped.
    fn read_attr(attr: &Attribute, name: &str) -> Option<AttrValue> {
        match decode_attr(attr) {
            Ok(value) => value,
            Err(err) => {
                log::debug!("skipping attribute {}: {}", name, err);
                None
            }
        }
    }

    fn decode_attr(attr: &Attribute) -> hdf5::Result<Option<AttrValue>> {
        let value = match attr.dtype()?.to_descriptor()? {
            TypeDescriptor::VarLenUnicode => {
                AttrValue::Text(attr.read_scalar::<VarLenUnicode>()?.as_str().to_owned())
            }
            TypeDescriptor::VarLenAscii => {
                AttrValue::Text(attr.read_scalar::<VarLenAscii>()?.as_str().to_owned())
            }
            TypeDescriptor::FixedAscii(_) => {
                AttrValue::Text(attr.read_scalar::<FixedAscii<256>>()?.as_str().to_owned())
            }
            TypeDescriptor::FixedUnicode(_) => {
                AttrValue::Text(attr.read_scalar::<FixedUnicode<256>>()?.as_str().to_owned())
            }
            TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) | TypeDescriptor::Float(_) => {
                let values = attr.read_raw::<f64>()?;
                if attr.is_scalar() || values.len() == 1 {
                    AttrValue::Number(values[0])
                } else {
                    AttrValue::Array(values)
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn write_text(location: &Location, name: &str, value: &str) -> hdf5::Result<()> {
        let value: VarLenUnicode = value
            .parse()
            .map_err(|err| hdf5::Error::Internal(format!("invalid attribute {}: {}", name, err)))?;
        location
            .new_attr::<VarLenUnicode>()
            .create(name)?
            .write_scalar(&value)
    }

    fn write_value(location: &Location, name: &str, value: &AttrValue) -> hdf5::Result<()> {
        match value {
            AttrValue::Number(number) => location
                .new_attr::<f64>()
                .create(name)?
                .write_scalar(number),
            AttrValue::Array(values) => location
                .new_attr::<f64>()
                .shape([values.len()])
                .create(name)?
                .write_raw(values),
            AttrValue::Text(text) => write_text(location, name, text),
        }
    }

    /// Write a recording using the current (version 2) layout.
    pub fn write_recording(path: &Path, recording: &Recording) -> Result<(), TraceError> {
        let file = File::create(path)?;
        let info = file.create_group("Info")?;
        info.new_attr::<f64>()
            .create("dt")?
            .write_scalar(&recording.info.dt)?;
        info.new_attr::<f64>()
            .create("tend")?
            .write_scalar(&recording.info.tend)?;
        info.new_attr::<i64>()
            .create("version")?
            .write_scalar(&SchemaVersion::V2.number())?;
        for (name, value) in &recording.info.extra {
            write_value(&info, name, value)?;
        }
        let root = file.create_group("Entities")?;
        for entity in &recording.entities {
            let node = root.create_group(&entity.id.to_string())?;
            node.new_dataset::<f64>()
                .shape([entity.data.len()])
                .create("Data")?
                .write_raw(&entity.data)?;
            if let Some(metadata) = &entity.metadata {
                let values: Vec<f64> = metadata.iter().copied().collect();
                node.new_dataset::<f64>()
                    .shape([metadata.nrows(), metadata.ncols()])
                    .create("Metadata")?
                    .write_raw(&values)?;
            }
            if let Some(name) = &entity.name {
                write_text(&node, "Name", name)?;
            }
            if let Some(units) = &entity.units {
                write_text(&node, "Units", units)?;
            }
            for (name, value) in &entity.attributes {
                write_value(&node, name, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "hdf5"))]
mod tests {
    use super::*;
    use hdf5::types::VarLenUnicode;
    use hdf5::File;
    use ndarray::array;
    use tempfile::tempdir;

    fn text(value: &str) -> VarLenUnicode {
        value.parse().unwrap()
    }

    #[test]
    fn version_2_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.h5");
        let mut voltage = TraceEntity::new(1, vec![-65.0, -64.5, -64.0]);
        voltage.name = Some("AnalogInput".into());
        voltage.units = Some("mV".into());
        let mut current = TraceEntity::new(2, vec![0.0, 100.0, 0.0]);
        current.name = Some("Waveform".into());
        current.units = Some("pA".into());
        current.metadata = Some(array![[0.5, 1.0, 0.0], [1.0, 1.0, 100.0]]);
        let mut extra = BTreeMap::new();
        extra.insert("startTimeSec".to_string(), AttrValue::Number(1.7e9));
        let recording = Recording {
            entities: vec![voltage, current],
            info: RunInfo {
                dt: 1e-4,
                tend: 1.0,
                version: SchemaVersion::V2,
                extra,
            },
        };
        write_recording(&path, &recording).unwrap();

        let loaded = load_trace(&path).unwrap();
        assert_eq!(loaded.entities.len(), 2);
        assert_eq!(loaded.info.dt, 1e-4);
        assert_eq!(loaded.info.tend, 1.0);
        assert_eq!(loaded.info.version, SchemaVersion::V2);
        assert_eq!(loaded.info.extra["startTimeSec"], AttrValue::Number(1.7e9));
        assert_eq!(loaded.entities[0].data, vec![-65.0, -64.5, -64.0]);
        assert_eq!(loaded.first_with_units("pA").unwrap().id, 2);
        assert_eq!(
            loaded.entity(2).unwrap().metadata.as_ref().unwrap().dim(),
            (2, 3)
        );
        assert_eq!(loaded.first_named("AnalogInput").unwrap().id, 1);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("future.h5");
        {
            let file = File::create(&path).unwrap();
            let info = file.create_group("Info").unwrap();
            info.new_attr::<i64>()
                .create("version")
                .unwrap()
                .write_scalar(&99)
                .unwrap();
        }
        let err = load_trace(&path).unwrap_err();
        assert!(matches!(err, TraceError::UnsupportedVersion(99)));
    }

    fn simulation_properties(file: &File) {
        let props = file.create_group("Misc/Simulation_properties").unwrap();
        props
            .new_attr::<f64>()
            .create("dt")
            .unwrap()
            .write_scalar(&5e-5)
            .unwrap();
        props
            .new_attr::<f64>()
            .create("tend")
            .unwrap()
            .write_scalar(&2.0)
            .unwrap();
    }

    #[test]
    fn version_0_merges_groups_by_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v0.h5");
        {
            let file = File::create(&path).unwrap();
            let data = file.create_group("Data").unwrap();
            for (name, values) in [("Entity-3", vec![1.0, 2.0]), ("Entity-1", vec![3.0])] {
                data.new_dataset::<f64>()
                    .shape([values.len()])
                    .create(name)
                    .unwrap()
                    .write_raw(&values)
                    .unwrap();
            }
            let metadata = file.create_group("Metadata").unwrap();
            metadata
                .new_dataset::<f64>()
                .shape([2, 2])
                .create("Metadata-3")
                .unwrap()
                .write_raw(&[1.0, 2.0, 3.0, 4.0])
                .unwrap();
            let parameters = file.create_group("Parameters").unwrap();
            parameters
                .new_dataset::<f64>()
                .shape([1])
                .create("Parameters-1")
                .unwrap()
                .write_raw(&[20.0])
                .unwrap();
            file.create_group("Misc").unwrap();
            simulation_properties(&file);
        }
        let loaded = load_trace(&path).unwrap();
        assert_eq!(loaded.info.version, SchemaVersion::V0);
        assert_eq!(loaded.info.dt, 5e-5);
        assert_eq!(loaded.entities[0].id, 1);
        assert_eq!(loaded.entities[0].parameters, Some(vec![20.0]));
        let three = loaded.entity(3).unwrap();
        assert_eq!(three.data, vec![1.0, 2.0]);
        assert_eq!(three.metadata.as_ref().unwrap()[[1, 0]], 3.0);
    }

    #[test]
    fn version_1_reads_attributes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v1.h5");
        {
            let file = File::create(&path).unwrap();
            let data = file.create_group("Data").unwrap();
            let ds = data
                .new_dataset::<f64>()
                .shape([3])
                .create("Entity-0")
                .unwrap();
            ds.write_raw(&[0.0, 1.0, 2.0]).unwrap();
            ds.new_attr::<VarLenUnicode>()
                .create("Units")
                .unwrap()
                .write_scalar(&text("pA"))
                .unwrap();
            ds.new_attr::<VarLenUnicode>()
                .create("Name")
                .unwrap()
                .write_scalar(&text("Waveform"))
                .unwrap();
            ds.new_attr::<f64>()
                .create("Gain")
                .unwrap()
                .write_scalar(&0.5)
                .unwrap();
            ds.new_attr::<f64>()
                .shape([2, 3])
                .create("Metadata_Waveform")
                .unwrap()
                .write_raw(&[1.0, 1.0, 0.0, 2.0, 1.0, 50.0])
                .unwrap();
            file.create_group("Misc").unwrap();
            simulation_properties(&file);
        }
        let loaded = load_trace(&path).unwrap();
        assert_eq!(loaded.info.version, SchemaVersion::V1);
        let entity = &loaded.entities[0];
        assert_eq!(entity.units.as_deref(), Some("pA"));
        assert_eq!(entity.name.as_deref(), Some("Waveform"));
        assert_eq!(entity.attributes["gain"], AttrValue::Number(0.5));
        assert_eq!(entity.metadata.as_ref().unwrap()[[1, 2]], 50.0);
    }

    #[test]
    fn version_1_plain_metadata_attribute() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v1_plain.h5");
        {
            let file = File::create(&path).unwrap();
            let data = file.create_group("Data").unwrap();
            let ds = data
                .new_dataset::<f64>()
                .shape([2])
                .create("Entity-3")
                .unwrap();
            ds.write_raw(&[0.0, 1.0]).unwrap();
            ds.new_attr::<f64>()
                .shape([1, 3])
                .create("Metadata")
                .unwrap()
                .write_raw(&[0.2, 1.0, -100.0])
                .unwrap();
            file.create_group("Misc").unwrap();
            simulation_properties(&file);
        }
        let entity = &load_trace(&path).unwrap().entities[0];
        assert_eq!(entity.id, 3);
        assert_eq!(entity.metadata.as_ref().unwrap()[[0, 2]], -100.0);
        assert!(!entity.attributes.contains_key("metadata"));
    }

    #[test]
    fn missing_file() {
        let dir = tempdir().unwrap();
        let err = load_trace(&dir.path().join("absent.h5")).unwrap_err();
        assert!(matches!(err, TraceError::NotFound(_)));
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;

    #[test]
    fn schema_versions() {
        assert_eq!(SchemaVersion::try_from(1).unwrap(), SchemaVersion::V1);
        assert!(matches!(
            SchemaVersion::try_from(99),
            Err(TraceError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn name_and_units_are_promoted() {
        let mut entity = TraceEntity::new(4, vec![]);
        entity
            .attributes
            .insert("units".into(), AttrValue::Text("mV".into()));
        entity
            .attributes
            .insert("rate".into(), AttrValue::Number(20000.0));
        entity.promote_attributes();
        assert_eq!(entity.units.as_deref(), Some("mV"));
        assert!(entity.attributes.contains_key("rate"));
        assert!(!entity.attributes.contains_key("units"));
    }
}
