//! Shared data model: where, and under which ownership scope, an
//! instance can be created.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A physical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GeoLocation {
    /// Human readable identifier (e.g. "Amsterdam").
    pub id: &'static str,
    /// ISO 3166-1 alpha-2 country code.
    pub country_code: &'static str,
}

pub const AMSTERDAM: GeoLocation = GeoLocation {
    id: "Amsterdam",
    country_code: "NL",
};
pub const BANGALORE: GeoLocation = GeoLocation {
    id: "Bangalore",
    country_code: "IN",
};
pub const FRANKFURT: GeoLocation = GeoLocation {
    id: "Frankfurt",
    country_code: "DE",
};
pub const LONDON: GeoLocation = GeoLocation {
    id: "London",
    country_code: "GB",
};
pub const NEW_YORK_CITY: GeoLocation = GeoLocation {
    id: "New York City",
    country_code: "US",
};
pub const SAN_FRANCISCO: GeoLocation = GeoLocation {
    id: "San Francisco",
    country_code: "US",
};
pub const SINGAPORE: GeoLocation = GeoLocation {
    id: "Singapore",
    country_code: "SG",
};
pub const SYDNEY: GeoLocation = GeoLocation {
    id: "Sydney",
    country_code: "AU",
};
pub const TORONTO: GeoLocation = GeoLocation {
    id: "Toronto",
    country_code: "CA",
};
pub const TOKYO: GeoLocation = GeoLocation {
    id: "Tokyo",
    country_code: "JP",
};
pub const MUMBAI: GeoLocation = GeoLocation {
    id: "Mumbai",
    country_code: "IN",
};
pub const SAO_PAULO: GeoLocation = GeoLocation {
    id: "Sao Paulo",
    country_code: "BR",
};
pub const LOS_ANGELES: GeoLocation = GeoLocation {
    id: "Los Angeles",
    country_code: "US",
};

/// A provider-specific region or zone.
///
/// Locations whose [`location`](CloudLocation::location) is `None` are
/// never offered as a choice.
pub trait CloudLocation: fmt::Debug + Send + Sync {
    /// Provider-specific identifier (region slug, zone name, ...).
    fn id(&self) -> &str;

    /// Physical location, if known.
    fn location(&self) -> Option<&'static GeoLocation>;
}

/// Shared handle to a location.
pub type Location = Arc<dyn CloudLocation>;

/// A project-like unit inside a compartment.
#[derive(Debug, Clone)]
pub struct CompartmentEntry {
    /// Unique identifier (e.g. project ID).
    pub id: String,
    /// Locations available under this entry.
    pub locations: Vec<Location>,
}

/// A top-level ownership scope, such as a billing account.
#[derive(Debug, Clone)]
pub struct Compartment {
    /// Unique identifier.
    pub id: String,
    /// Display name (account email, billing account name, ...).
    pub name: String,
    /// Entries in this compartment.
    pub entries: Vec<CompartmentEntry>,
}

/// Result payload of a successful bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfiguration {
    /// Publicly reachable address of the server.
    pub external_ip: String,
    /// Management port.
    pub port: u16,
    /// Credential for the management API.
    pub access_token: String,
}

impl ServerConfiguration {
    /// JSON encoding carried by the `ProvisioningCompleted` event.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the JSON encoding produced by [`encode`](Self::encode).
    ///
    /// # Errors
    /// Returns an error if `raw` is not a valid configuration.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Display names of all compartments, in order.
#[must_use]
pub fn compartment_names(compartments: &[Compartment]) -> Vec<String> {
    compartments.iter().map(|c| c.name.clone()).collect()
}

/// Identifiers of all entries, in order.
#[must_use]
pub fn entry_ids(entries: &[CompartmentEntry]) -> Vec<String> {
    entries.iter().map(|e| e.id.clone()).collect()
}

/// Selection label for a location, or `None` if it has no `GeoLocation`.
#[must_use]
pub fn location_label(location: &dyn CloudLocation) -> Option<String> {
    location
        .location()
        .map(|geo| format!("{} - {} [{}]", location.id(), geo.id, geo.country_code))
}

/// Selection labels for every location of `entry` that has a `GeoLocation`.
#[must_use]
pub fn location_labels(entry: &CompartmentEntry) -> Vec<String> {
    entry
        .locations
        .iter()
        .filter_map(|l| location_label(l.as_ref()))
        .collect()
}

/// Inverse of [`location_label`].
#[must_use]
pub fn location_by_label<'a>(locations: &'a [Location], label: &str) -> Option<&'a Location> {
    locations
        .iter()
        .find(|&l| location_label(l.as_ref()).is_some_and(|candidate| candidate == label))
}

/// Find a compartment by display name.
#[must_use]
pub fn compartment_by_name<'a>(
    compartments: &'a [Compartment],
    name: &str,
) -> Option<&'a Compartment> {
    compartments.iter().find(|c| c.name == name)
}

/// Find an entry by identifier.
#[must_use]
pub fn entry_by_id<'a>(entries: &'a [CompartmentEntry], id: &str) -> Option<&'a CompartmentEntry> {
    entries.iter().find(|e| e.id == id)
}

/// Find an entry by identifier across all compartments.
#[must_use]
pub fn find_entry<'a>(compartments: &'a [Compartment], id: &str) -> Option<&'a CompartmentEntry> {
    compartments.iter().find_map(|c| entry_by_id(&c.entries, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestLocation {
        id: &'static str,
        geo: Option<&'static GeoLocation>,
    }

    impl CloudLocation for TestLocation {
        fn id(&self) -> &str {
            self.id
        }

        fn location(&self) -> Option<&'static GeoLocation> {
            self.geo
        }
    }

    fn locations() -> Vec<Location> {
        vec![
            Arc::new(TestLocation {
                id: "ams3",
                geo: Some(&AMSTERDAM),
            }) as Location,
            Arc::new(TestLocation {
                id: "xyz1",
                geo: None,
            }) as Location,
            Arc::new(TestLocation {
                id: "sgp1",
                geo: Some(&SINGAPORE),
            }) as Location,
        ]
    }

    #[test]
    fn test_label_format() {
        let loc = TestLocation {
            id: "fra1",
            geo: Some(&FRANKFURT),
        };
        assert_eq!(location_label(&loc).unwrap(), "fra1 - Frankfurt [DE]");
    }

    #[test]
    fn test_labels_skip_unknown_geo() {
        let entry = CompartmentEntry {
            id: "p".into(),
            locations: locations(),
        };
        assert_eq!(
            location_labels(&entry),
            vec!["ams3 - Amsterdam [NL]", "sgp1 - Singapore [SG]"]
        );
    }

    #[test]
    fn test_lookup_by_label_is_inverse_of_label() {
        let locs = locations();
        for loc in locs.iter().filter(|l| l.location().is_some()) {
            let label = location_label(loc.as_ref()).unwrap();
            let found = location_by_label(&locs, &label).unwrap();
            assert!(Arc::ptr_eq(found, loc));
        }
        assert!(location_by_label(&locs, "xyz1 - Nowhere [ZZ]").is_none());
    }

    #[test]
    fn test_lookups_borrow_stored_elements() {
        let compartments = vec![Compartment {
            id: "acct".into(),
            name: "me@example.com".into(),
            entries: vec![
                CompartmentEntry {
                    id: "one".into(),
                    locations: vec![],
                },
                CompartmentEntry {
                    id: "two".into(),
                    locations: locations(),
                },
            ],
        }];

        let c = compartment_by_name(&compartments, "me@example.com").unwrap();
        assert!(std::ptr::eq(c, &compartments[0]));
        let e = entry_by_id(&c.entries, "two").unwrap();
        assert!(std::ptr::eq(e, &compartments[0].entries[1]));
        assert!(std::ptr::eq(find_entry(&compartments, "two").unwrap(), e));
        assert!(compartment_by_name(&compartments, "nobody").is_none());
        assert_eq!(compartment_names(&compartments), vec!["me@example.com"]);
        assert_eq!(entry_ids(&c.entries), vec!["one", "two"]);
    }

    #[test]
    fn test_server_configuration_encoding() {
        let conf = ServerConfiguration {
            external_ip: "203.0.113.5".into(),
            port: 443,
            access_token: "abc".into(),
        };
        assert_eq!(
            conf.encode().unwrap(),
            r#"{"external_ip":"203.0.113.5","port":443,"access_token":"abc"}"#
        );
    }
}
