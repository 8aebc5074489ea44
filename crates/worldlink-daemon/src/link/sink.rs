//! Fleet event sink.
//!
//! The link does not own truck or shipment records. Side effects of inbound
//! events are reported through [`FleetEventSink`], which the business layer
//! implements and passes to [`super::SimulatorLink::new`].
//!
//! Sink methods are called from the reader task. They must return promptly;
//! a slow sink stalls every reply on the connection.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use worldlink_core::fleet::{TruckId, TruckSnapshot, TruckStatus, WarehouseId};

/// Business-layer shipment identifier.
pub type ShipmentId = String;

/// Receiver of fleet side effects.
pub trait FleetEventSink: Send + Sync {
    /// Returns the business layer's record of a truck, if it knows it.
    fn lookup_truck(&self, truck_id: TruckId) -> Option<TruckSnapshot>;

    /// Stores a truck's new position and status.
    fn persist_truck_position(&self, truck_id: TruckId, x: i32, y: i32, status: &TruckStatus);

    /// Returns the shipment the truck is currently assigned to.
    fn active_shipment_for_truck(&self, truck_id: TruckId) -> Option<ShipmentId>;

    /// Marks a shipment delivered.
    fn mark_shipment_delivered(&self, shipment_id: &str);

    /// Reports that a truck reached the warehouse for a shipment.
    fn notify_warehouse_arrival(
        &self,
        truck_id: TruckId,
        warehouse_id: WarehouseId,
        shipment_id: &str,
    );
}

/// A recorded warehouse arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarehouseArrival {
    /// Truck that arrived.
    pub truck_id: TruckId,
    /// Warehouse it arrived at.
    pub warehouse_id: WarehouseId,
    /// Shipment it is collecting.
    pub shipment_id: ShipmentId,
}

#[derive(Debug, Default)]
struct FleetRecords {
    trucks: HashMap<TruckId, TruckSnapshot>,
    assignments: HashMap<TruckId, ShipmentId>,
    delivered: Vec<ShipmentId>,
    arrivals: Vec<WarehouseArrival>,
}

/// In-memory [`FleetEventSink`].
///
/// Backs the standalone daemon and tests. Only trucks it was seeded with
/// are known; events for other trucks are ignored by the router.
#[derive(Debug, Default)]
pub struct InMemoryFleet {
    inner: Mutex<FleetRecords>,
}

impl InMemoryFleet {
    /// Creates a sink that knows `trucks`.
    #[must_use]
    pub fn new(trucks: impl IntoIterator<Item = TruckSnapshot>) -> Self {
        let trucks = trucks.into_iter().map(|t| (t.truck_id, t)).collect();
        Self {
            inner: Mutex::new(FleetRecords {
                trucks,
                ..FleetRecords::default()
            }),
        }
    }

    /// Assigns a shipment to a truck.
    pub fn assign_shipment(&self, truck_id: TruckId, shipment_id: impl Into<ShipmentId>) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .assignments
            .insert(truck_id, shipment_id.into());
    }

    /// Returns the stored record of a truck.
    #[must_use]
    pub fn truck(&self, truck_id: TruckId) -> Option<TruckSnapshot> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .trucks
            .get(&truck_id)
            .cloned()
    }

    /// All known trucks, ordered by id.
    #[must_use]
    pub fn trucks(&self) -> Vec<TruckSnapshot> {
        let mut trucks: Vec<TruckSnapshot> = self
            .inner
            .lock()
            .expect("lock poisoned")
            .trucks
            .values()
            .cloned()
            .collect();
        trucks.sort_by_key(|t| t.truck_id);
        trucks
    }

    /// Shipments marked delivered, in order.
    #[must_use]
    pub fn delivered(&self) -> Vec<ShipmentId> {
        self.inner.lock().expect("lock poisoned").delivered.clone()
    }

    /// Warehouse arrivals reported, in order.
    #[must_use]
    pub fn arrivals(&self) -> Vec<WarehouseArrival> {
        self.inner.lock().expect("lock poisoned").arrivals.clone()
    }
}

impl FleetEventSink for InMemoryFleet {
    fn lookup_truck(&self, truck_id: TruckId) -> Option<TruckSnapshot> {
        self.truck(truck_id)
    }

    fn persist_truck_position(&self, truck_id: TruckId, x: i32, y: i32, status: &TruckStatus) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let truck = inner
            .trucks
            .entry(truck_id)
            .or_insert_with(|| TruckSnapshot::idle(truck_id, x, y));
        truck.x = x;
        truck.y = y;
        truck.status = status.clone();
    }

    fn active_shipment_for_truck(&self, truck_id: TruckId) -> Option<ShipmentId> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .assignments
            .get(&truck_id)
            .cloned()
    }

    fn mark_shipment_delivered(&self, shipment_id: &str) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.assignments.retain(|_, assigned| assigned != shipment_id);
        inner.delivered.push(shipment_id.to_string());
    }

    fn notify_warehouse_arrival(
        &self,
        truck_id: TruckId,
        warehouse_id: WarehouseId,
        shipment_id: &str,
    ) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .arrivals
            .push(WarehouseArrival {
                truck_id,
                warehouse_id,
                shipment_id: shipment_id.to_string(),
            });
    }
}
