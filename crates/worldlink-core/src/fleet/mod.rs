//! Fleet domain types shared by the simulator link and its collaborators.
//!
//! The link layer does not own authoritative truck or shipment state. It
//! keeps a lightweight view of each truck (a [`TruckSnapshot`]) for building
//! the connect handshake, and reports changes to the business layer through
//! a sink. The types here are that shared vocabulary.
//!
//! # Validation
//!
//! Command arguments are checked before anything reaches the wire. A
//! [`ValidationError`] is returned synchronously at the API boundary.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Simulator-side truck identifier.
pub type TruckId = i32;

/// Simulator-side warehouse identifier.
pub type WarehouseId = i32;

/// Package identifier. The fleet backend uses the shipment id here.
pub type PackageId = i64;

/// Wire string for an idle truck.
pub const STATUS_IDLE: &str = "idle";
/// Wire string for a truck on its way somewhere.
pub const STATUS_TRAVELING: &str = "traveling";
/// Wire string for a truck that reached its pickup warehouse.
pub const STATUS_ARRIVE_WAREHOUSE: &str = "arrive warehouse";
/// Wire string for a truck being loaded.
pub const STATUS_LOADING: &str = "loading";
/// Wire string for a truck out on deliveries.
pub const STATUS_DELIVERING: &str = "delivering";

/// Truck status as reported by the simulator.
///
/// Unknown strings are preserved in [`TruckStatus::Other`] so that a newer
/// simulator never causes a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TruckStatus {
    /// Waiting for work.
    #[default]
    Idle,
    /// Driving to a warehouse or delivery point.
    Traveling,
    /// Arrived at the pickup warehouse.
    AtWarehouse,
    /// Being loaded at the warehouse.
    Loading,
    /// Delivering packages.
    Delivering,
    /// A status string this build does not recognise.
    Other(String),
}

impl TruckStatus {
    /// Parses a simulator status string.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            STATUS_IDLE => Self::Idle,
            STATUS_TRAVELING => Self::Traveling,
            STATUS_ARRIVE_WAREHOUSE => Self::AtWarehouse,
            STATUS_LOADING => Self::Loading,
            STATUS_DELIVERING => Self::Delivering,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the simulator status string.
    #[must_use]
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Idle => STATUS_IDLE,
            Self::Traveling => STATUS_TRAVELING,
            Self::AtWarehouse => STATUS_ARRIVE_WAREHOUSE,
            Self::Loading => STATUS_LOADING,
            Self::Delivering => STATUS_DELIVERING,
            Self::Other(raw) => raw,
        }
    }

    /// Returns `true` if the truck has arrived at its pickup warehouse.
    #[must_use]
    pub const fn is_at_warehouse(&self) -> bool {
        matches!(self, Self::AtWarehouse)
    }
}

impl From<String> for TruckStatus {
    fn from(raw: String) -> Self {
        Self::from_wire(&raw)
    }
}

impl From<TruckStatus> for String {
    fn from(status: TruckStatus) -> Self {
        match status {
            TruckStatus::Other(raw) => raw,
            known => known.as_wire().to_string(),
        }
    }
}

impl fmt::Display for TruckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// The link layer's view of a single truck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruckSnapshot {
    /// Simulator truck id.
    #[serde(alias = "id")]
    pub truck_id: TruckId,

    /// X coordinate.
    #[serde(default)]
    pub x: i32,

    /// Y coordinate.
    #[serde(default)]
    pub y: i32,

    /// Last known status.
    #[serde(default)]
    pub status: TruckStatus,
}

impl TruckSnapshot {
    /// Creates an idle truck at the given position.
    #[must_use]
    pub const fn idle(truck_id: TruckId, x: i32, y: i32) -> Self {
        Self {
            truck_id,
            x,
            y,
            status: TruckStatus::Idle,
        }
    }
}

/// Builds the default fleet: `count` idle trucks with ids `1..=count` at the
/// origin.
#[must_use]
pub fn default_fleet(count: usize) -> Vec<TruckSnapshot> {
    (1..=count)
        .map_while(|n| TruckId::try_from(n).ok())
        .map(|id| TruckSnapshot::idle(id, 0, 0))
        .collect()
}

/// A single package drop-off for a delivery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryDrop {
    /// Package (shipment) id.
    pub package_id: PackageId,
    /// Destination X coordinate.
    pub x: i32,
    /// Destination Y coordinate.
    pub y: i32,
}

impl DeliveryDrop {
    /// Creates a drop-off.
    #[must_use]
    pub const fn new(package_id: PackageId, x: i32, y: i32) -> Self {
        Self { package_id, x, y }
    }
}

/// Invalid command arguments, rejected before any wire interaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Truck ids are non-negative.
    #[error("invalid truck id {0}: must be non-negative")]
    InvalidTruckId(TruckId),

    /// Warehouse ids are non-negative.
    #[error("invalid warehouse id {0}: must be non-negative")]
    InvalidWarehouseId(WarehouseId),

    /// A delivery run needs at least one package.
    #[error("delivery for truck {truck_id} has no packages")]
    EmptyDelivery {
        /// Truck that was asked to deliver.
        truck_id: TruckId,
    },

    /// Package ids are non-negative.
    #[error("invalid package id {0}: must be non-negative")]
    InvalidPackageId(PackageId),

    /// Each package may appear only once per delivery run.
    #[error("package {0} appears more than once in the delivery")]
    DuplicatePackage(PackageId),
}

/// Checks a pickup request.
pub fn validate_pickup(truck_id: TruckId, warehouse_id: WarehouseId) -> Result<(), ValidationError> {
    validate_truck(truck_id)?;
    if warehouse_id < 0 {
        return Err(ValidationError::InvalidWarehouseId(warehouse_id));
    }
    Ok(())
}

/// Checks a delivery request.
pub fn validate_delivery(truck_id: TruckId, drops: &[DeliveryDrop]) -> Result<(), ValidationError> {
    validate_truck(truck_id)?;
    if drops.is_empty() {
        return Err(ValidationError::EmptyDelivery { truck_id });
    }
    let mut seen = HashSet::with_capacity(drops.len());
    for drop in drops {
        if drop.package_id < 0 {
            return Err(ValidationError::InvalidPackageId(drop.package_id));
        }
        if !seen.insert(drop.package_id) {
            return Err(ValidationError::DuplicatePackage(drop.package_id));
        }
    }
    Ok(())
}

/// Checks a truck id on its own (queries).
pub const fn validate_truck(truck_id: TruckId) -> Result<(), ValidationError> {
    if truck_id < 0 {
        return Err(ValidationError::InvalidTruckId(truck_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_strings_round_trip() {
        for raw in [
            STATUS_IDLE,
            STATUS_TRAVELING,
            STATUS_ARRIVE_WAREHOUSE,
            STATUS_LOADING,
            STATUS_DELIVERING,
        ] {
            let status = TruckStatus::from_wire(raw);
            assert!(!matches!(status, TruckStatus::Other(_)), "{raw} parsed as Other");
            assert_eq!(status.as_wire(), raw);
        }
    }

    #[test]
    fn unknown_status_is_preserved() {
        let status = TruckStatus::from_wire("refuelling");
        assert_eq!(status, TruckStatus::Other("refuelling".to_string()));
        assert_eq!(String::from(status), "refuelling");
    }

    #[test]
    fn arrive_warehouse_is_at_warehouse() {
        assert!(TruckStatus::from_wire("arrive warehouse").is_at_warehouse());
        assert!(!TruckStatus::Loading.is_at_warehouse());
    }

    #[test]
    fn default_fleet_numbers_trucks_from_one() {
        let fleet = default_fleet(3);
        assert_eq!(
            fleet,
            vec![
                TruckSnapshot::idle(1, 0, 0),
                TruckSnapshot::idle(2, 0, 0),
                TruckSnapshot::idle(3, 0, 0),
            ]
        );
        assert!(default_fleet(0).is_empty());
    }

    #[test]
    fn pickup_validation() {
        assert!(validate_pickup(1, 3).is_ok());
        assert!(validate_pickup(0, 0).is_ok());
        assert_eq!(
            validate_pickup(-1, 3),
            Err(ValidationError::InvalidTruckId(-1))
        );
        assert_eq!(
            validate_pickup(1, -2),
            Err(ValidationError::InvalidWarehouseId(-2))
        );
    }

    #[test]
    fn delivery_validation() {
        let drops = [DeliveryDrop::new(10, 1, 1), DeliveryDrop::new(11, 2, 2)];
        assert!(validate_delivery(4, &drops).is_ok());

        assert_eq!(
            validate_delivery(4, &[]),
            Err(ValidationError::EmptyDelivery { truck_id: 4 })
        );

        let dup = [DeliveryDrop::new(10, 1, 1), DeliveryDrop::new(10, 5, 5)];
        assert_eq!(
            validate_delivery(4, &dup),
            Err(ValidationError::DuplicatePackage(10))
        );

        let negative = [DeliveryDrop::new(-7, 1, 1)];
        assert_eq!(
            validate_delivery(4, &negative),
            Err(ValidationError::InvalidPackageId(-7))
        );
    }

    #[test]
    fn snapshot_accepts_id_alias() {
        #[derive(Deserialize)]
        struct Wrapper {
            trucks: Vec<TruckSnapshot>,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
            [[trucks]]
            id = 7
            x = 3
            y = -4
            "#,
        )
        .unwrap();
        assert_eq!(parsed.trucks, vec![TruckSnapshot::idle(7, 3, -4)]);
    }
}
