//! Region catalogs: region id -> ordered targets, loaded from CSV or JSON
//!
//! CSV rows are `location,repeatCount[,weight[,kind]]`, one region per row with
//! the 1-based row number as its id. JSON is
//! `{"<id>": {"warmup": [..], "targets": [..], "weight": w}}` where a target is
//! `{"pc": 4096 | "0x1000", "count": n}` or `{"offset": n, "count": n}`.
use crate::{Error, Location, Region, RegionKind, Result, Target};
use log::{info, warn};
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{self, MapAccess, Visitor},
};
use std::{cmp::Ordering, collections::BTreeMap, fmt, path::Path, str::FromStr};

const CSV_HEADER: [&str; 4] = ["location", "repeatcount", "weight", "kind"];

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    /// targets of the warmup part, may be empty
    pub warmup: Vec<Target>,
    /// targets of the detail part, may be empty for warmup-only CSV rows
    pub targets: Vec<Target>,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionCatalog {
    /// file name or other label used in diagnostics
    pub origin: String,
    pub entries: Vec<CatalogEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PcValue {
    Int(u64),
    Text(String),
}

#[derive(Serialize, Deserialize)]
struct JsonTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pc: Option<PcValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    count: i64,
}

#[derive(Serialize, Deserialize)]
struct JsonEntry {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warmup: Vec<JsonTarget>,
    #[serde(default)]
    targets: Vec<JsonTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weight: Option<f64>,
}

/// Catalog body in file order; a repeated region id is rejected
struct JsonCatalog(Vec<(String, JsonEntry)>);

impl<'de> Deserialize<'de> for JsonCatalog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct Entries;

        impl<'de> Visitor<'de> for Entries {
            type Value = JsonCatalog;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from region id to region")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, JsonEntry)> = vec![];
                while let Some((id, entry)) = map.next_entry::<String, JsonEntry>()? {
                    if entries.iter().any(|(other, _)| *other == id) {
                        return Err(de::Error::custom(format!("region {id} is listed twice")));
                    }
                    entries.push((id, entry));
                }
                Ok(JsonCatalog(entries))
            }
        }

        deserializer.deserialize_map(Entries)
    }
}

/// A CSV header names known columns only, in order
fn is_csv_header(fields: &[&str]) -> bool {
    !fields.is_empty()
        && fields.len() <= CSV_HEADER.len()
        && fields
            .iter()
            .zip(CSV_HEADER)
            .all(|(field, name)| field.eq_ignore_ascii_case(name))
}

/// Parse `0x`-prefixed hex or decimal
pub fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_location(text: &str) -> Option<Location> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('+') {
        let offset = i64::try_from(parse_u64(rest)?).ok()?;
        Some(Location::Relative(offset))
    } else if let Some(rest) = text.strip_prefix('-') {
        let offset = i64::try_from(parse_u64(rest)?).ok()?;
        Some(Location::Relative(-offset))
    } else {
        parse_u64(text).map(Location::Absolute)
    }
}

/// Region ids order numerically when both are numbers
fn compare_ids(left: &str, right: &str) -> Ordering {
    match (left.parse::<u64>(), right.parse::<u64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => left.cmp(right),
    }
}

fn check_count(origin: &str, place: &str, count: i64) -> Result<u64> {
    if count <= 0 {
        return Err(Error::configuration(
            origin,
            format!("{place}: repeat count must be positive, got {count}"),
        ));
    }
    Ok(count as u64)
}

/// Relative offsets in one region must be strictly increasing
fn check_monotonic(origin: &str, id: &str, kind: RegionKind, targets: &[Target]) -> Result<()> {
    let mut last: Option<(usize, i64)> = None;
    for (index, target) in targets.iter().enumerate() {
        if let Location::Relative(offset) = target.location {
            if let Some((last_index, last_offset)) = last {
                if offset <= last_offset {
                    return Err(Error::configuration(
                        origin,
                        format!(
                            "{kind} region {id} target {index}: relative offset {} does not follow offset {} of target {last_index}",
                            target.location,
                            Location::Relative(last_offset)
                        ),
                    ));
                }
            }
            last = Some((index, offset));
        }
    }
    Ok(())
}

/// `location,count` as given on the command line, e.g. `0x6ffed1,1`
impl FromStr for Target {
    type Err = String;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let (location, count) = text
            .split_once(',')
            .ok_or_else(|| format!("expected location,count but got {text:?}"))?;
        let location =
            parse_location(location).ok_or_else(|| format!("invalid location {location:?}"))?;
        let count = parse_u64(count)
            .filter(|count| *count > 0)
            .ok_or_else(|| format!("invalid repeat count {count:?}"))?;
        Ok(Target { location, count })
    }
}

impl JsonTarget {
    fn to_target(&self, origin: &str, place: &str) -> Result<Target> {
        let count = check_count(origin, place, self.count)?;
        let location = match (&self.pc, self.offset) {
            (Some(PcValue::Int(pc)), None) => Location::Absolute(*pc),
            (Some(PcValue::Text(text)), None) => {
                Location::Absolute(parse_u64(text).ok_or_else(|| {
                    Error::configuration(origin, format!("{place}: invalid pc {text:?}"))
                })?)
            }
            (None, Some(offset)) => Location::Relative(offset),
            _ => {
                return Err(Error::configuration(
                    origin,
                    format!("{place}: exactly one of pc and offset must be given"),
                ));
            }
        };
        Ok(Target { location, count })
    }

    fn from_target(target: &Target) -> Self {
        match target.location {
            Location::Absolute(pc) => JsonTarget {
                pc: Some(PcValue::Text(format!("0x{:x}", pc))),
                offset: None,
                count: target.count as i64,
            },
            Location::Relative(offset) => JsonTarget {
                pc: None,
                offset: Some(offset),
                count: target.count as i64,
            },
        }
    }
}

impl RegionCatalog {
    /// Build from entries, applying the same checks as the file loaders
    pub fn new(origin: impl Into<String>, entries: Vec<CatalogEntry>) -> Result<Self> {
        let catalog = Self {
            origin: origin.into(),
            entries,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn empty() -> Self {
        Self {
            origin: "<empty>".to_string(),
            entries: vec![],
        }
    }

    fn validate(&self) -> Result<()> {
        let origin = &self.origin;
        for (index, entry) in self.entries.iter().enumerate() {
            if self.entries[..index].iter().any(|other| other.id == entry.id) {
                return Err(Error::configuration(
                    origin,
                    format!("region {} is listed twice", entry.id),
                ));
            }
            if entry.warmup.is_empty() && entry.targets.is_empty() {
                return Err(Error::configuration(
                    origin,
                    format!("region {} has no targets", entry.id),
                ));
            }
            for (kind, targets) in [
                (RegionKind::Warmup, &entry.warmup),
                (RegionKind::Detail, &entry.targets),
            ] {
                for (target_index, target) in targets.iter().enumerate() {
                    if target.count == 0 {
                        return Err(Error::configuration(
                            origin,
                            format!(
                                "{kind} region {} target {target_index}: repeat count must be positive",
                                entry.id
                            ),
                        ));
                    }
                }
                check_monotonic(origin, &entry.id, kind, targets)?;
            }
            if let Some(weight) = entry.weight {
                if !weight.is_finite() || weight < 0.0 {
                    return Err(Error::configuration(
                        origin,
                        format!("region {}: invalid weight {weight}", entry.id),
                    ));
                }
                if entry.targets.is_empty() {
                    warn!(
                        "{}: region {} carries a weight but has no detail targets",
                        origin, entry.id
                    );
                }
            }
        }
        Ok(())
    }

    pub fn parse_csv(origin: &str, content: &str) -> Result<Self> {
        let mut entries = vec![];
        let mut row = 0;
        for (line_index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let place = format!("line {}", line_index + 1);

            // a header is only tolerated before the first row
            if row == 0 && is_csv_header(&fields) {
                continue;
            }
            let Some(location) = parse_location(fields[0]) else {
                return Err(Error::configuration(
                    origin,
                    format!("{place}: invalid location {:?}", fields[0]),
                ));
            };
            if fields.len() < 2 || fields.len() > 4 {
                return Err(Error::configuration(
                    origin,
                    format!("{place}: expected location,repeatCount[,weight[,kind]]"),
                ));
            }
            let count: i64 = fields[1].parse().map_err(|_| {
                Error::configuration(origin, format!("{place}: invalid repeat count {:?}", fields[1]))
            })?;
            let count = check_count(origin, &place, count)?;
            let weight = match fields.get(2) {
                Some(text) if !text.is_empty() => Some(text.parse::<f64>().map_err(|_| {
                    Error::configuration(origin, format!("{place}: invalid weight {text:?}"))
                })?),
                _ => None,
            };
            let kind = match fields.get(3).map(|text| text.to_ascii_lowercase()) {
                None => RegionKind::Detail,
                Some(text) if text.is_empty() || text == "detail" => RegionKind::Detail,
                Some(text) if text == "warmup" => RegionKind::Warmup,
                Some(text) => {
                    return Err(Error::configuration(
                        origin,
                        format!("{place}: unknown region kind {text:?}"),
                    ));
                }
            };

            row += 1;
            let target = Target { location, count };
            let (warmup, targets) = match kind {
                RegionKind::Warmup => (vec![target], vec![]),
                RegionKind::Detail => (vec![], vec![target]),
            };
            entries.push(CatalogEntry {
                id: row.to_string(),
                warmup,
                targets,
                weight,
            });
        }
        Self::new(origin, entries)
    }

    pub fn parse_json(origin: &str, content: &str) -> Result<Self> {
        let JsonCatalog(mut raw) = serde_json::from_str(content)
            .map_err(|err| Error::configuration(origin, err.to_string()))?;
        raw.sort_by(|(left, _), (right, _)| compare_ids(left, right));

        let mut entries = vec![];
        for (id, entry) in &raw {
            let convert = |kind: RegionKind, targets: &[JsonTarget]| -> Result<Vec<Target>> {
                targets
                    .iter()
                    .enumerate()
                    .map(|(index, target)| {
                        target.to_target(origin, &format!("{kind} region {id} target {index}"))
                    })
                    .collect()
            };
            entries.push(CatalogEntry {
                id: id.clone(),
                warmup: convert(RegionKind::Warmup, &entry.warmup)?,
                targets: convert(RegionKind::Detail, &entry.targets)?,
                weight: entry.weight,
            });
        }
        Self::new(origin, entries)
    }

    /// Load by extension, falling back to sniffing the content
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::configuration(&origin, err.to_string()))?;
        let is_json = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => true,
            Some("csv") => false,
            _ => content.trim_start().starts_with('{'),
        };
        let catalog = if is_json {
            Self::parse_json(&origin, &content)?
        } else {
            Self::parse_csv(&origin, &content)?
        };
        info!(
            "Loaded {} regions from {}",
            catalog.entries.len(),
            catalog.origin
        );
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Narrow down to a single region, as a restore does
    pub fn select(&self, id: &str) -> Result<Self> {
        match self.get(id) {
            Some(entry) => Ok(Self {
                origin: format!("{}#{}", self.origin, id),
                entries: vec![entry.clone()],
            }),
            None => Err(Error::configuration(
                &self.origin,
                format!(
                    "no region {id:?}, available: {}",
                    self.entries
                        .iter()
                        .map(|entry| entry.id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )),
        }
    }

    /// Flatten into the ordered region list the tracker walks: the warmup part
    /// of an entry comes right before its detail part
    pub fn regions(&self) -> Vec<Region> {
        let mut regions = vec![];
        for entry in &self.entries {
            if !entry.warmup.is_empty() {
                regions.push(Region {
                    id: entry.id.clone(),
                    kind: RegionKind::Warmup,
                    targets: entry.warmup.clone(),
                    weight: None,
                });
            }
            if !entry.targets.is_empty() {
                regions.push(Region {
                    id: entry.id.clone(),
                    kind: RegionKind::Detail,
                    targets: entry.targets.clone(),
                    weight: entry.weight,
                });
            }
        }
        regions
    }

    /// Rebuild a catalog from tracker regions, merging warmup and detail parts
    /// that share an id
    pub fn from_regions(origin: impl Into<String>, regions: &[Region]) -> Result<Self> {
        let mut entries: Vec<CatalogEntry> = vec![];
        for region in regions {
            let index = match entries.iter().position(|entry| entry.id == region.id) {
                Some(index) => index,
                None => {
                    entries.push(CatalogEntry {
                        id: region.id.clone(),
                        warmup: vec![],
                        targets: vec![],
                        weight: None,
                    });
                    entries.len() - 1
                }
            };
            let entry = &mut entries[index];
            match region.kind {
                RegionKind::Warmup => entry.warmup.extend(&region.targets),
                RegionKind::Detail => {
                    entry.targets.extend(&region.targets);
                    entry.weight = region.weight;
                }
            }
        }
        Self::new(origin, entries)
    }

    pub fn to_json(&self) -> Result<String> {
        let raw: BTreeMap<&str, JsonEntry> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.id.as_str(),
                    JsonEntry {
                        warmup: entry.warmup.iter().map(JsonTarget::from_target).collect(),
                        targets: entry.targets.iter().map(JsonTarget::from_target).collect(),
                        weight: entry.weight,
                    },
                )
            })
            .collect();
        serde_json::to_string_pretty(&raw).map_err(|err| Error::configuration(&self.origin, err.to_string()))
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .map_err(|err| Error::configuration(path.display().to_string(), err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv() {
        let catalog = RegionCatalog::parse_csv(
            "test.csv",
            "location,repeatCount,weight,kind\n# comment\n0x1000,2,,warmup\n8192,1,0.5\n+0x40,3\n",
        )
        .unwrap();
        assert_eq!(catalog.entries.len(), 3);
        assert_eq!(catalog.entries[0].id, "1");
        assert_eq!(catalog.entries[0].warmup, vec![Target::absolute(0x1000, 2)]);
        assert!(catalog.entries[0].targets.is_empty());
        assert_eq!(catalog.entries[1].targets, vec![Target::absolute(0x2000, 1)]);
        assert_eq!(catalog.entries[1].weight, Some(0.5));
        assert_eq!(catalog.entries[2].targets, vec![Target::relative(0x40, 3)]);

        let regions = catalog.regions();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].kind, RegionKind::Warmup);
        assert_eq!(regions[1].kind, RegionKind::Detail);
    }

    #[test]
    fn test_csv_errors() {
        for content in [
            "0x1000,-1\n",
            "0x1000,0\n",
            "0x1000\n",
            "0x1000,1,0.1,sideways\n",
            "0x1000,1\nzzz,1\n",
            "0x1000,1,-0.5\n",
            "0xzz,1\n0x1000,1\n",
            "location,count\n0x1000,1\n",
            "0x1000,1\nlocation,repeatCount\n",
        ] {
            match RegionCatalog::parse_csv("bad.csv", content) {
                Err(Error::Configuration { origin, .. }) => assert_eq!(origin, "bad.csv"),
                other => panic!("{content:?} should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_json() {
        let catalog = RegionCatalog::parse_json(
            "test.json",
            r#"{
                "10": {"targets": [{"pc": 4096, "count": 1}]},
                "2": {
                    "warmup": [{"pc": "0x100", "count": 5}],
                    "targets": [{"offset": 16, "count": 1}, {"offset": 32, "count": 2}],
                    "weight": 0.25
                }
            }"#,
        )
        .unwrap();
        let ids: Vec<&str> = catalog.entries.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, ["2", "10"]);

        let regions = catalog.regions();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].kind, RegionKind::Warmup);
        assert_eq!(regions[0].targets, vec![Target::absolute(0x100, 5)]);
        assert_eq!(regions[1].weight, Some(0.25));
        assert_eq!(regions[2].id, "10");

        let selected = catalog.select("10").unwrap();
        assert_eq!(selected.entries.len(), 1);
        assert!(catalog.select("3").is_err());

        let reparsed = RegionCatalog::parse_json("again.json", &catalog.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.entries, catalog.entries);
    }

    #[test]
    fn test_target_from_str() {
        assert_eq!(
            "0x6c830f,6479283".parse::<Target>().unwrap(),
            Target::absolute(0x6c830f, 6479283)
        );
        assert_eq!("-16,2".parse::<Target>().unwrap(), Target::relative(-16, 2));
        assert!("0x6c830f".parse::<Target>().is_err());
        assert!("0x6c830f,0".parse::<Target>().is_err());
    }

    #[test]
    fn test_json_errors() {
        for content in [
            r#"{"1": {"targets": [{"pc": 1, "offset": 2, "count": 1}]}}"#,
            r#"{"1": {"targets": [{"count": 1}]}}"#,
            r#"{"1": {"targets": [{"pc": "0xzz", "count": 1}]}}"#,
            r#"{"1": {"targets": [{"pc": 1, "count": -3}]}}"#,
            r#"{"1": {"targets": [{"offset": 8, "count": 1}, {"offset": 4, "count": 1}]}}"#,
            r#"{"1": {"targets": []}}"#,
            r#"{"1": {"targets": [{"pc": 1, "count": 1}]}, "1": {"targets": [{"pc": 2, "count": 1}]}}"#,
            r#"[1, 2]"#,
        ] {
            assert!(
                matches!(
                    RegionCatalog::parse_json("bad.json", content),
                    Err(Error::Configuration { .. })
                ),
                "{content} should be rejected"
            );
        }

        match RegionCatalog::parse_json(
            "twice.json",
            r#"{"7": {"targets": [{"pc": 1, "count": 1}]}, "7": {"targets": [{"pc": 2, "count": 1}]}}"#,
        ) {
            Err(Error::Configuration { message, .. }) => assert!(message.contains("listed twice")),
            other => panic!("a repeated id should be rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_csv_header() {
        let catalog =
            RegionCatalog::parse_csv("header.csv", "Location,RepeatCount\n0x1000,1\n").unwrap();
        assert_eq!(catalog.entries.len(), 1);
        assert_eq!(catalog.entries[0].id, "1");

        match RegionCatalog::parse_csv("bad.csv", "0xzz,1\n0x1000,1\n") {
            Err(Error::Configuration { message, .. }) => {
                assert!(message.contains("line 1"));
                assert!(message.contains("0xzz"));
            }
            other => panic!("a malformed first row should be rejected, got {other:?}"),
        }
    }
}
